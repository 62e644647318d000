use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;

use crate::paths::RepoPath;

/// Location of the harness configuration, relative to the repo root.
pub const CONFIG_FILE: &str = ".config/bork.json";

#[derive(Debug)]
pub enum ConfigError {
    Malformed(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Malformed(details) => {
                write!(f, "configuration is malformed: {}", details)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Validated harness configuration.
///
/// Absence of the config file is equivalent to an empty object; both fields
/// default. Every configured path must stay inside the repo root, which
/// `RepoPath` parsing enforces.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub correctness_checker: Option<RepoPath>,
    pub edits_require_approval: BTreeSet<RepoPath>,
}

// Raw wire shape. Unknown fields are ignored so older binaries keep working
// against newer config files.
#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    #[serde(default)]
    correctness_checker: Option<String>,
    #[serde(default)]
    edits_require_approval: Vec<String>,
}

pub fn load(root: &Path) -> Result<Config, ConfigError> {
    let path = root.join(CONFIG_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => {
            return Err(ConfigError::Malformed(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )));
        }
    };

    parse(&contents)
}

fn parse(contents: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = serde_json::from_str(contents)
        .map_err(|e| ConfigError::Malformed(format!("invalid JSON: {}", e)))?;

    let correctness_checker = raw
        .correctness_checker
        .map(|value| {
            RepoPath::parse(&value).map_err(|e| {
                ConfigError::Malformed(format!("correctness-checker: {}", e))
            })
        })
        .transpose()?;

    let mut edits_require_approval = BTreeSet::new();
    for value in raw.edits_require_approval {
        let path = RepoPath::parse(&value).map_err(|e| {
            ConfigError::Malformed(format!("edits-require-approval: {}", e))
        })?;
        edits_require_approval.insert(path);
    }

    Ok(Config {
        correctness_checker,
        edits_require_approval,
    })
}
