use std::env;
use std::fmt;
use std::future::Future;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Value, json};

use crate::actions::ActionSet;

/// Environment variable that switches on request/response logging to the
/// diagnostic stream.
pub const DEBUG_LOG_ENV: &str = "BORK_ENABLE_DEBUG_LOG";

const URL_ENV: &str = "BORK_LLM_URL";
const MODEL_ENV: &str = "BORK_LLM_MODEL";
const API_KEY_ENV: &str = "BORK_LLM_API_KEY";

const DEFAULT_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o";

#[derive(Debug)]
pub enum LlmError {
    Unreachable(String),
    Refused(String),
    ReplyNotJson(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LlmError::Unreachable(details) => write!(f, "LLM endpoint unreachable: {}", details),
            LlmError::Refused(details) => write!(f, "LLM refused the request: {}", details),
            LlmError::ReplyNotJson(details) => {
                write!(f, "LLM reply carried no usable action payload: {}", details)
            }
        }
    }
}

impl std::error::Error for LlmError {}

pub fn debug_log_enabled() -> bool {
    env::var(DEBUG_LOG_ENV).is_ok_and(|v| v == "1")
}

/// The model seam. One request in, one raw textual reply out; the reply is
/// untrusted and is parsed elsewhere.
pub trait LlmClient {
    fn complete(&self, prompt: &str) -> impl Future<Output = Result<String, LlmError>>;
}

/// HTTP client speaking the chat-completions protocol. Endpoint, model, and
/// credentials come from the environment (`.env` is honored by the binary);
/// the credential is opaque to the harness.
pub struct HttpLlmClient {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    pub fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            url: env::var(URL_ENV).unwrap_or_else(|_| DEFAULT_URL.to_string()),
            model: env::var(MODEL_ENV).unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            api_key: env::var(API_KEY_ENV).ok(),
        }
    }
}

impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        if debug_log_enabled() {
            eprintln!("[debug] LLM request to {}:\n{}", self.url, prompt);
        }

        let body = json!({
            "model": self.model,
            "messages": [ { "role": "user", "content": prompt } ],
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LlmError::Unreachable(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Unreachable(e.to_string()))?;

        if !status.is_success() {
            return Err(LlmError::Unreachable(format!(
                "HTTP {}: {}",
                status,
                truncate(&text, 500)
            )));
        }

        let envelope: Value = serde_json::from_str(&text).map_err(|e| {
            LlmError::Unreachable(format!("malformed provider response: {}", e))
        })?;
        let reply = envelope["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                LlmError::Unreachable("provider response carried no message content".to_string())
            })?
            .to_string();

        if debug_log_enabled() {
            eprintln!("[debug] LLM response:\n{}", reply);
        }

        Ok(reply)
    }
}

/// Pull the action payload out of a raw reply. The JSON may be fenced, may
/// be embedded in surrounding prose, or may be the whole reply; the first
/// top-level object whose shape matches the action schema wins. A reply
/// with no payload is either a refusal (marker heuristic) or not-JSON.
pub fn extract_action_set(reply: &str) -> Result<ActionSet, LlmError> {
    for candidate in candidate_objects(reply) {
        if ActionSet::value_matches_schema(&candidate) {
            return ActionSet::from_value(&candidate).map_err(LlmError::ReplyNotJson);
        }
    }

    if is_refusal(reply) {
        Err(LlmError::Refused(truncate(reply.trim(), 300).to_string()))
    } else {
        Err(LlmError::ReplyNotJson(
            "no JSON object matching the action schema".to_string(),
        ))
    }
}

fn fenced_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex")
    })
}

/// Parseable JSON objects in the reply, in order of appearance: fenced
/// blocks first (the common reply style), then any brace-balanced object
/// found by scanning.
fn candidate_objects(reply: &str) -> Vec<Value> {
    let mut found = Vec::new();

    for captures in fenced_block_re().captures_iter(reply) {
        if let Some(block) = captures.get(1)
            && let Ok(value) = serde_json::from_str::<Value>(block.as_str())
        {
            found.push(value);
        }
    }

    let bytes = reply.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = balanced_object_end(bytes, i) {
                if let Ok(value) = serde_json::from_str::<Value>(&reply[i..=end]) {
                    found.push(value);
                    i = end + 1;
                    continue;
                }
            }
        }
        i += 1;
    }

    found
}

/// Index of the `}` closing the object that opens at `start`, honoring
/// string literals and escapes. None when unbalanced.
fn balanced_object_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_refusal(reply: &str) -> bool {
    let lower = reply.to_lowercase();
    let markers = [
        "i can't",
        "i cannot",
        "i won't",
        "unable to help",
        "unable to comply",
        "not able to assist",
        "against my guidelines",
    ];
    markers.iter().any(|marker| lower.contains(marker))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
