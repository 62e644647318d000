use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::actions::{self, Action, ValidatedActions};
use crate::approval::ApprovalGate;
use crate::checker::{self, CheckerOutcome, CheckerReport, describe_finding};
use crate::commit::apply_action;
use crate::config::Config;
use crate::llm::{self, LlmClient, LlmError};
use crate::prompt;
use crate::snapshot::{self, SnapshotError};

/// Hard bound on LLM calls per reconciliation.
pub const MAX_ITERATIONS: u32 = 5;

/// The controller's whole state: which LLM call we are on (1-based) and the
/// findings feeding the next prompt. Created at start, mutated only here,
/// dropped on termination.
#[derive(Debug, Default)]
pub struct LoopState {
    pub iteration: u32,
    pub last_findings: Option<CheckerReport>,
}

/// How a reconciliation ended. Fatal conditions surface as
/// [`ReconcileError`] instead.
#[derive(Debug)]
pub enum Termination {
    /// The checker (when configured) saw zero findings on the final state.
    Clean,
    /// The iteration cap was hit with findings outstanding. Commits stand;
    /// a human must review the carried report.
    Escalate(CheckerReport),
}

#[derive(Debug)]
pub enum ReconcileError {
    Snapshot(SnapshotError),
    Llm(LlmError),
    CheckerFailed(String),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReconcileError::Snapshot(e) => write!(f, "{}", e),
            ReconcileError::Llm(e) => write!(f, "{}", e),
            ReconcileError::CheckerFailed(details) => {
                write!(f, "correctness checker failed: {}", details)
            }
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<SnapshotError> for ReconcileError {
    fn from(e: SnapshotError) -> Self {
        ReconcileError::Snapshot(e)
    }
}

impl From<LlmError> for ReconcileError {
    fn from(e: LlmError) -> Self {
        ReconcileError::Llm(e)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub verbose: bool,
    /// Stop after validation: print dispositions, commit nothing, run no
    /// checker.
    pub dry_run: bool,
    /// May lower the iteration cap below [`MAX_ITERATIONS`], never raise it.
    pub max_iterations: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            dry_run: false,
            max_iterations: MAX_ITERATIONS,
        }
    }
}

/// Drives one reconciliation: snapshot, prompt, model, vetting, commit,
/// checker, and the continue/terminate/escalate decision, sequentially and
/// single-threaded. Nothing is ever rolled back; a later iteration's edits
/// overwrite earlier ones naturally.
pub struct Reconciler<'a, L: LlmClient, A: ApprovalGate> {
    root: &'a Path,
    config: Config,
    client: &'a L,
    gate: &'a A,
    options: RunOptions,
}

impl<'a, L: LlmClient, A: ApprovalGate> Reconciler<'a, L, A> {
    pub fn new(
        root: &'a Path,
        config: Config,
        client: &'a L,
        gate: &'a A,
        options: RunOptions,
    ) -> Self {
        Self {
            root,
            config,
            client,
            gate,
            options,
        }
    }

    pub async fn run(&self) -> Result<Termination, ReconcileError> {
        let debug = DebugSession::create(self.root);
        let cap = self.options.max_iterations.clamp(1, MAX_ITERATIONS);
        let mut state = LoopState::default();

        loop {
            state.iteration += 1;
            println!("=== Iteration {}/{} ===", state.iteration, cap);

            let snap = snapshot::take(self.root, self.options.verbose)?;
            let request = prompt::assemble(&snap, state.last_findings.as_ref());
            debug.write(state.iteration, "prompt.txt", request.as_bytes());

            let reply = self.client.complete(&request).await?;
            debug.write(state.iteration, "reply.txt", reply.as_bytes());

            // A reply that fails to parse applies zero actions.
            let set = llm::extract_action_set(&reply)?;
            let validated = actions::validate(set, &self.config);
            if debug.enabled() {
                debug.write(state.iteration, "actions.json", &actions_json(&validated));
            }
            report_rejections(&validated);

            if self.options.dry_run {
                print_plan(&validated);
                return Ok(Termination::Clean);
            }

            let applied = self.commit_phase(validated);
            if self.options.verbose {
                println!("applied {} action(s)", applied);
            }

            let Some(checker_path) = &self.config.correctness_checker else {
                println!("✓ no correctness checker configured; reconciliation complete");
                return Ok(Termination::Clean);
            };

            match checker::run(self.root, checker_path) {
                CheckerOutcome::Clean => {
                    println!("✓ checker reported a clean tree");
                    return Ok(Termination::Clean);
                }
                CheckerOutcome::Findings(report) => {
                    debug.write(
                        state.iteration,
                        "checker_report.json",
                        &serde_json::to_vec_pretty(&report).unwrap_or_default(),
                    );
                    let count = report.finding_count();
                    if state.iteration >= cap {
                        eprintln!(
                            "✗ iteration cap reached with {} unresolved finding(s)",
                            count
                        );
                        return Ok(Termination::Escalate(report));
                    }
                    println!("checker reported {} finding(s); continuing", count);
                    state.last_findings = Some(report);
                }
                CheckerOutcome::Failed(finding) => {
                    return Err(ReconcileError::CheckerFailed(describe_finding(&finding)));
                }
            }
        }
    }

    /// Mediate approvals one action at a time, then apply everything that
    /// survived. Per-action apply failures are reported and skipped so one
    /// bad path never takes down the batch.
    fn commit_phase(&self, validated: ValidatedActions) -> usize {
        let ValidatedActions {
            accepted,
            approval_pending,
            ..
        } = validated;

        let mut to_apply = accepted;
        for action in approval_pending {
            match self.gate.review(&action) {
                Ok(true) => to_apply.push(action),
                Ok(false) => print_rejected("edit denied by the approver", &action),
                Err(e) => {
                    eprintln!("✗ approval prompt failed ({}); treating as denied", e);
                    print_rejected("edit denied by the approver", &action);
                }
            }
        }

        let mut applied = 0;
        for action in &to_apply {
            match apply_action(self.root, action) {
                Ok(()) => {
                    applied += 1;
                    if self.options.verbose {
                        println!("✓ applied {}", action.path());
                    }
                }
                Err(e) => eprintln!("✗ {}", e),
            }
        }
        applied
    }
}

fn report_rejections(validated: &ValidatedActions) {
    for rejection in &validated.rejected_syntax {
        eprintln!(
            "dropping proposed action with invalid path '{}': {}",
            rejection.path.escape_default(),
            rejection.reason
        );
    }
    for action in &validated.rejected_printed {
        print_rejected("rejected edit to immutable path", action);
    }
}

/// Rejections print the full attempted mutation so the operator can see
/// what the model wanted to do.
fn print_rejected(reason: &str, action: &Action) {
    match action {
        Action::CreateOrUpdate { path, contents } => eprintln!(
            "✗ {} {}; attempted contents:\n{}",
            reason,
            path,
            String::from_utf8_lossy(contents)
        ),
        Action::Delete { path } => {
            eprintln!("✗ {} {}; attempted action: delete", reason, path)
        }
    }
}

/// Render the vetted action set, disposition by disposition, for the debug
/// session mirror.
fn actions_json(validated: &ValidatedActions) -> Vec<u8> {
    fn describe(actions: &[Action]) -> Vec<serde_json::Value> {
        actions
            .iter()
            .map(|action| match action {
                Action::CreateOrUpdate { path, contents } => json!({
                    "op": "create-or-update",
                    "path": path,
                    "contents": String::from_utf8_lossy(contents),
                }),
                Action::Delete { path } => json!({ "op": "delete", "path": path }),
            })
            .collect()
    }

    let value = json!({
        "accepted": describe(&validated.accepted),
        "approval-pending": describe(&validated.approval_pending),
        "rejected-immutable": describe(&validated.rejected_printed),
        "rejected-syntax": validated
            .rejected_syntax
            .iter()
            .map(|rejection| json!({
                "path": rejection.path,
                "reason": rejection.reason.to_string(),
            }))
            .collect::<Vec<_>>(),
    });
    serde_json::to_vec_pretty(&value).unwrap_or_default()
}

fn print_plan(validated: &ValidatedActions) {
    println!("dry run; no edits applied");
    for action in &validated.accepted {
        match action {
            Action::CreateOrUpdate { path, contents } => {
                println!("would write {} ({} bytes)", path, contents.len())
            }
            Action::Delete { path } => println!("would delete {}", path),
        }
    }
    for action in &validated.approval_pending {
        println!("would request approval for {}", action.path());
    }
}

/// Optional per-iteration artifact mirror, active only when the debug-log
/// flag is set. Lives under `.bork/debug/<timestamp>/iteration_<n>/`, which
/// the snapshotter excludes.
struct DebugSession {
    dir: Option<PathBuf>,
}

impl DebugSession {
    fn create(root: &Path) -> Self {
        if !llm::debug_log_enabled() {
            return Self { dir: None };
        }
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let dir = root.join(".bork").join("debug").join(ts);
        match fs::create_dir_all(&dir) {
            Ok(()) => Self { dir: Some(dir) },
            Err(e) => {
                eprintln!("warning: cannot create debug session dir: {}", e);
                Self { dir: None }
            }
        }
    }

    fn enabled(&self) -> bool {
        self.dir.is_some()
    }

    fn write(&self, iteration: u32, name: &str, bytes: &[u8]) {
        let Some(dir) = &self.dir else { return };
        let iteration_dir = dir.join(format!("iteration_{}", iteration));
        if fs::create_dir_all(&iteration_dir).is_err() {
            return;
        }
        fs::write(iteration_dir.join(name), bytes).ok();
    }
}
