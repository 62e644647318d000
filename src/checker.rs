use std::path::Path;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::paths::RepoPath;

/// Sentinel substituted for checker output that is not valid UTF-8.
pub const NON_UTF8_SENTINEL: &str = "<non-UTF8 output>";

/// One observation from the correctness checker. `code-review` findings are
/// freeform reviewer text; `command` findings capture a command execution
/// the checker ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provenance", rename_all = "kebab-case")]
pub enum Finding {
    CodeReview {
        #[serde(default)]
        file: Option<RepoPath>,
        finding: String,
    },
    Command {
        command: String,
        stdout: String,
        stderr: String,
        #[serde(rename = "exit-code")]
        exit_code: i32,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckerReport {
    #[serde(default)]
    pub per_file_findings: Vec<Finding>,
    #[serde(default)]
    pub overall_findings: Vec<Finding>,
}

impl CheckerReport {
    pub fn finding_count(&self) -> usize {
        self.per_file_findings.len() + self.overall_findings.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Finding> {
        self.per_file_findings
            .iter()
            .chain(self.overall_findings.iter())
    }
}

/// Classified result of one checker run.
#[derive(Debug)]
pub enum CheckerOutcome {
    Clean,
    Findings(CheckerReport),
    /// The checker itself failed. Carries a `command` finding describing the
    /// invocation for the operator.
    Failed(Finding),
}

/// Run the configured checker with no arguments and CWD at the repo root.
/// Exit 0 is clean; exit 1 carries a report on stdout; exit 2, unparseable
/// reports, spawn failures, and every other exit mean the checker failed.
/// No timeout is imposed here; the sandbox bounds resources.
pub fn run(root: &Path, checker: &RepoPath) -> CheckerOutcome {
    let exe = checker.to_fs_path(root);
    let output = match Command::new(&exe)
        .current_dir(root)
        .stdin(Stdio::null())
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            return CheckerOutcome::Failed(Finding::Command {
                command: checker.as_str().to_string(),
                stdout: String::new(),
                stderr: format!("failed to spawn checker: {}", e),
                exit_code: -1,
            });
        }
    };

    // Killed by signal maps to -1, which is "any other exit" below.
    let exit_code = output.status.code().unwrap_or(-1);

    match exit_code {
        0 => CheckerOutcome::Clean,
        1 => match serde_json::from_slice::<CheckerReport>(&output.stdout) {
            Ok(report) => CheckerOutcome::Findings(report),
            Err(e) => CheckerOutcome::Failed(Finding::Command {
                command: checker.as_str().to_string(),
                stdout: lossy_or_sentinel(&output.stdout),
                stderr: format!(
                    "exit 1 but stdout is not a findings report ({}); original stderr: {}",
                    e,
                    lossy_or_sentinel(&output.stderr)
                ),
                exit_code,
            }),
        },
        _ => CheckerOutcome::Failed(Finding::Command {
            command: checker.as_str().to_string(),
            stdout: lossy_or_sentinel(&output.stdout),
            stderr: lossy_or_sentinel(&output.stderr),
            exit_code,
        }),
    }
}

fn lossy_or_sentinel(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => NON_UTF8_SENTINEL.to_string(),
    }
}

/// Render a finding for the operator and for the next prompt.
pub fn describe_finding(finding: &Finding) -> String {
    match finding {
        Finding::CodeReview { file, finding } => match file {
            Some(file) => format!("[code-review] {}: {}", file, finding),
            None => format!("[code-review] {}", finding),
        },
        Finding::Command {
            command,
            stdout,
            stderr,
            exit_code,
        } => format!(
            "[command] `{}` exited {}\nstdout:\n{}\nstderr:\n{}",
            command, exit_code, stdout, stderr
        ),
    }
}
