//! End-to-end reconciliation scenarios driven by a scripted model.
//!
//! Each test builds a throwaway repository, feeds the loop canned replies,
//! and asserts on the resulting tree and termination. The checker, when
//! configured, is a real subprocess (a small shell script), so the full
//! exit-code contract is exercised.
#![cfg(unix)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bork::actions::Action;
use bork::approval::ApprovalGate;
use bork::config;
use bork::llm::{LlmClient, LlmError};
use bork::reconcile::{ReconcileError, Reconciler, RunOptions, Termination};
use serde_json::json;

struct ScriptedLlm {
    replies: RefCell<VecDeque<String>>,
    calls: Cell<usize>,
}

impl ScriptedLlm {
    fn new<S: Into<String>>(replies: Vec<S>) -> Self {
        Self {
            replies: RefCell::new(replies.into_iter().map(Into::into).collect()),
            calls: Cell::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl LlmClient for ScriptedLlm {
    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        self.calls.set(self.calls.get() + 1);
        self.replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| LlmError::Unreachable("reply script exhausted".to_string()))
    }
}

struct ApproveAll;

impl ApprovalGate for ApproveAll {
    fn review(&self, _action: &Action) -> io::Result<bool> {
        Ok(true)
    }
}

struct DenyAll;

impl ApprovalGate for DenyAll {
    fn review(&self, _action: &Action) -> io::Result<bool> {
        Ok(false)
    }
}

/// A repo root inside a witness directory, so escapes can be asserted
/// against the surrounding tree.
struct Sandbox {
    outer: tempfile::TempDir,
    root: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let outer = tempfile::TempDir::new().unwrap();
        let root = outer.path().join("repo");
        fs::create_dir(&root).unwrap();
        Self { outer, root }
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn write(&self, rel: &str, contents: &str) {
        let full = self.root.join(rel);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, contents).unwrap();
    }

    fn install_checker(&self, script: &str) {
        let path = self.root.join("checker.sh");
        fs::write(&path, script).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        self.write(
            ".config/bork.json",
            r#"{ "correctness-checker": "checker.sh" }"#,
        );
    }

    /// Names of entries directly inside the witness directory.
    fn outer_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.outer.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

async fn run<L: LlmClient, A: ApprovalGate>(
    sandbox: &Sandbox,
    client: &L,
    gate: &A,
) -> Result<Termination, ReconcileError> {
    let harness_config = config::load(sandbox.root()).unwrap();
    let options = RunOptions::default();
    Reconciler::new(sandbox.root(), harness_config, client, gate, options)
        .run()
        .await
}

fn reply(value: serde_json::Value) -> String {
    value.to_string()
}

const FINDING_CHECKER: &str = r#"#!/bin/sh
printf '{"per-file-findings":[],"overall-findings":[{"provenance":"code-review","finding":"still not conforming"}]}'
exit 1
"#;

#[tokio::test]
async fn create_applies_and_terminates_clean_without_a_checker() {
    let sandbox = Sandbox::new();
    sandbox.write("README.md", "# demo\n");

    let client = ScriptedLlm::new(vec![reply(
        json!({ "create-or-update": { "hello.txt": "hi\n" }, "delete": [] }),
    )]);
    let outcome = run(&sandbox, &client, &ApproveAll).await.unwrap();

    assert!(matches!(outcome, Termination::Clean));
    assert_eq!(client.calls(), 1);
    assert_eq!(
        fs::read_to_string(sandbox.root().join("hello.txt")).unwrap(),
        "hi\n"
    );
}

#[tokio::test]
async fn traversal_attempt_creates_nothing_anywhere() {
    let sandbox = Sandbox::new();
    sandbox.write("README.md", "# demo\n");

    let client = ScriptedLlm::new(vec![reply(
        json!({ "create-or-update": { "../evil": "x" }, "delete": [] }),
    )]);
    let outcome = run(&sandbox, &client, &ApproveAll).await.unwrap();

    assert!(matches!(outcome, Termination::Clean));
    assert_eq!(sandbox.outer_entries(), vec!["repo".to_string()]);
    assert!(!sandbox.root().join("evil").exists());
}

#[tokio::test]
async fn symlink_attack_never_reaches_the_link_target() {
    let sandbox = Sandbox::new();
    sandbox.write("README.md", "# demo\n");
    let target = tempfile::TempDir::new().unwrap();
    std::os::unix::fs::symlink(target.path(), sandbox.root().join("link")).unwrap();

    let client = ScriptedLlm::new(vec![reply(
        json!({ "create-or-update": { "link/file": "x" }, "delete": [] }),
    )]);
    let outcome = run(&sandbox, &client, &ApproveAll).await.unwrap();

    assert!(matches!(outcome, Termination::Clean));
    assert!(!target.path().join("file").exists());
}

#[tokio::test]
async fn immutable_config_survives_a_write_attempt() {
    let sandbox = Sandbox::new();
    sandbox.write(".config/bork.json", "{}");

    let client = ScriptedLlm::new(vec![reply(json!({
        "create-or-update": { ".config/bork.json": "{\"correctness-checker\": \"evil\"}" },
        "delete": []
    }))]);
    let outcome = run(&sandbox, &client, &ApproveAll).await.unwrap();

    assert!(matches!(outcome, Termination::Clean));
    assert_eq!(
        fs::read_to_string(sandbox.root().join(".config/bork.json")).unwrap(),
        "{}"
    );
}

#[tokio::test]
async fn vcs_metadata_survives_delete_attempts() {
    let sandbox = Sandbox::new();
    sandbox.write(".git/config", "[core]\n");
    sandbox.write("README.md", "# demo\n");

    let client = ScriptedLlm::new(vec![reply(
        json!({ "delete": [".git/config", ".git"] }),
    )]);
    let outcome = run(&sandbox, &client, &ApproveAll).await.unwrap();

    assert!(matches!(outcome, Termination::Clean));
    assert!(sandbox.root().join(".git/config").exists());
}

#[tokio::test]
async fn denied_spec_edit_leaves_the_spec_untouched() {
    let sandbox = Sandbox::new();
    sandbox.write("specs/foo.md", "---\nkind: spec\n---\noriginal\n");

    let client = ScriptedLlm::new(vec![reply(json!({
        "create-or-update": { "specs/foo.md": "---\nkind: spec\n---\nrewritten\n" },
        "delete": []
    }))]);
    let outcome = run(&sandbox, &client, &DenyAll).await.unwrap();

    assert!(matches!(outcome, Termination::Clean));
    assert_eq!(
        fs::read_to_string(sandbox.root().join("specs/foo.md")).unwrap(),
        "---\nkind: spec\n---\noriginal\n"
    );
}

#[tokio::test]
async fn approved_spec_edit_goes_through() {
    let sandbox = Sandbox::new();
    sandbox.write("specs/foo.md", "---\nkind: spec\n---\noriginal\n");

    let client = ScriptedLlm::new(vec![reply(json!({
        "create-or-update": { "specs/foo.md": "---\nkind: spec\n---\nrewritten\n" },
        "delete": []
    }))]);
    let outcome = run(&sandbox, &client, &ApproveAll).await.unwrap();

    assert!(matches!(outcome, Termination::Clean));
    assert_eq!(
        fs::read_to_string(sandbox.root().join("specs/foo.md")).unwrap(),
        "---\nkind: spec\n---\nrewritten\n"
    );
}

#[tokio::test]
async fn iteration_cap_escalates_after_exactly_five_calls() {
    let sandbox = Sandbox::new();
    sandbox.write("src/app.rs", "fn main() {}\n");
    sandbox.install_checker(FINDING_CHECKER);

    let churn = reply(json!({
        "create-or-update": { "src/app.rs": "fn main() { /* again */ }\n" },
        "delete": []
    }));
    let client = ScriptedLlm::new(vec![churn; 5]);
    let outcome = run(&sandbox, &client, &ApproveAll).await.unwrap();

    assert_eq!(client.calls(), 5);
    match outcome {
        Termination::Escalate(report) => assert_eq!(report.finding_count(), 1),
        other => panic!("expected escalation, got {:?}", other),
    }
    assert_eq!(
        fs::read_to_string(sandbox.root().join("src/app.rs")).unwrap(),
        "fn main() { /* again */ }\n"
    );
}

#[tokio::test]
async fn clean_checker_terminates_after_one_iteration() {
    let sandbox = Sandbox::new();
    sandbox.write("src/app.rs", "fn main() {}\n");
    sandbox.install_checker("#!/bin/sh\nexit 0\n");

    let client = ScriptedLlm::new(vec![reply(
        json!({ "create-or-update": {}, "delete": [] }),
    )]);
    let outcome = run(&sandbox, &client, &ApproveAll).await.unwrap();

    assert!(matches!(outcome, Termination::Clean));
    assert_eq!(client.calls(), 1);
}

#[tokio::test]
async fn checker_exit_two_is_fatal() {
    let sandbox = Sandbox::new();
    sandbox.write("src/app.rs", "fn main() {}\n");
    sandbox.install_checker("#!/bin/sh\necho 'checker blew up' >&2\nexit 2\n");

    let client = ScriptedLlm::new(vec![reply(
        json!({ "create-or-update": {}, "delete": [] }),
    )]);
    let err = run(&sandbox, &client, &ApproveAll).await.unwrap_err();

    assert!(matches!(err, ReconcileError::CheckerFailed(_)));
}

#[tokio::test]
async fn unparseable_findings_report_is_a_checker_failure() {
    let sandbox = Sandbox::new();
    sandbox.write("src/app.rs", "fn main() {}\n");
    sandbox.install_checker("#!/bin/sh\necho 'not json'\nexit 1\n");

    let client = ScriptedLlm::new(vec![reply(
        json!({ "create-or-update": {}, "delete": [] }),
    )]);
    let err = run(&sandbox, &client, &ApproveAll).await.unwrap_err();

    assert!(matches!(err, ReconcileError::CheckerFailed(_)));
}

#[tokio::test]
async fn garbage_reply_applies_zero_actions() {
    let sandbox = Sandbox::new();
    sandbox.write("keep.txt", "keep\n");

    let client = ScriptedLlm::new(vec!["no structured payload here at all".to_string()]);
    let err = run(&sandbox, &client, &ApproveAll).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Llm(LlmError::ReplyNotJson(_))));
    assert_eq!(
        fs::read_to_string(sandbox.root().join("keep.txt")).unwrap(),
        "keep\n"
    );
}

#[tokio::test]
async fn refusal_reply_is_reported_as_a_refusal() {
    let sandbox = Sandbox::new();
    sandbox.write("keep.txt", "keep\n");

    let client = ScriptedLlm::new(vec!["I cannot help with that.".to_string()]);
    let err = run(&sandbox, &client, &ApproveAll).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Llm(LlmError::Refused(_))));
}

#[tokio::test]
async fn dry_run_commits_nothing() {
    let sandbox = Sandbox::new();
    sandbox.write("README.md", "# demo\n");

    let client = ScriptedLlm::new(vec![reply(
        json!({ "create-or-update": { "hello.txt": "hi\n" }, "delete": ["README.md"] }),
    )]);
    let harness_config = config::load(sandbox.root()).unwrap();
    let options = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };
    let outcome = Reconciler::new(sandbox.root(), harness_config, &client, &ApproveAll, options)
        .run()
        .await
        .unwrap();

    assert!(matches!(outcome, Termination::Clean));
    assert!(!sandbox.root().join("hello.txt").exists());
    assert!(sandbox.root().join("README.md").exists());
}

#[tokio::test]
async fn snapshot_then_identity_commit_roundtrips_the_tree() {
    let sandbox = Sandbox::new();
    sandbox.write("a.txt", "alpha\n");
    sandbox.write("nested/b.txt", "beta\n");
    sandbox.write("specs/c.md", "---\nkind: spec\n---\ngamma\n");

    let snap = bork::snapshot::take(sandbox.root(), false).unwrap();
    let mut creates = serde_json::Map::new();
    for file in &snap.files {
        creates.insert(
            file.path.as_str().to_string(),
            serde_json::Value::String(String::from_utf8(file.contents.clone()).unwrap()),
        );
    }
    let client = ScriptedLlm::new(vec![reply(json!({ "create-or-update": creates }))]);

    let outcome = run(&sandbox, &client, &ApproveAll).await.unwrap();
    assert!(matches!(outcome, Termination::Clean));

    for (rel, contents) in [
        ("a.txt", "alpha\n"),
        ("nested/b.txt", "beta\n"),
        ("specs/c.md", "---\nkind: spec\n---\ngamma\n"),
    ] {
        assert_eq!(
            fs::read_to_string(sandbox.root().join(rel)).unwrap(),
            contents,
            "{} changed across a snapshot/commit round trip",
            rel
        );
    }
}

#[tokio::test]
async fn delete_of_absent_path_is_tolerated() {
    let sandbox = Sandbox::new();
    sandbox.write("keep.txt", "keep\n");

    let client = ScriptedLlm::new(vec![reply(
        json!({ "delete": ["never/existed.txt", "keep.txt"] }),
    )]);
    let outcome = run(&sandbox, &client, &ApproveAll).await.unwrap();

    assert!(matches!(outcome, Termination::Clean));
    assert!(!sandbox.root().join("keep.txt").exists());
}
