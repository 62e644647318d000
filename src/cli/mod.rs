use anyhow::{Context, Result};
use std::path::Path;

use bork::approval::StdinApproval;
use bork::checker::{CheckerOutcome, describe_finding};
use bork::llm::HttpLlmClient;
use bork::reconcile::{Reconciler, RunOptions, Termination};

#[derive(Clone, Copy)]
pub struct Config {
    pub verbose: bool,
    pub dry_run: bool,
}

/// Run the reconciliation loop. Returns the process exit code:
/// 0 clean, 1 escalated to a human, 2 error (config, LLM, checker).
pub async fn reconcile(root: &Path, max_iterations: u32, config: &Config) -> Result<i32> {
    let harness_config =
        bork::config::load(root).context("failed to load .config/bork.json")?;

    if config.verbose {
        println!("repo root: {}", root.display());
        match &harness_config.correctness_checker {
            Some(checker) => println!("correctness checker: {}", checker),
            None => println!("no correctness checker configured"),
        }
    }

    let client = HttpLlmClient::from_env();
    let gate = StdinApproval;
    let options = RunOptions {
        verbose: config.verbose,
        dry_run: config.dry_run,
        max_iterations,
    };

    let reconciler = Reconciler::new(root, harness_config, &client, &gate, options);
    match reconciler.run().await? {
        Termination::Clean => {
            println!("✓ reconciliation complete");
            Ok(0)
        }
        Termination::Escalate(report) => {
            eprintln!("Reconciliation did not converge; manual review required:");
            for finding in report.iter() {
                eprintln!("- {}", describe_finding(finding));
            }
            Ok(1)
        }
    }
}

/// Print the snapshot the model would receive: one line per file with its
/// role and size, plus the spec diff when the VCS provides one.
pub fn snapshot(root: &Path, config: &Config) -> Result<i32> {
    let snap = bork::snapshot::take(root, config.verbose)?;

    for file in &snap.files {
        println!(
            "{:<14} {:>9}  {}",
            file.role.label(),
            file.contents.len(),
            file.path
        );
    }

    match &snap.spec_diff {
        Some(diff) if config.verbose => {
            println!("\nspec diff against main:\n{}", diff);
        }
        Some(_) => println!("\nspec diff against main: present (use --verbose to print)"),
        None => println!("\nspec diff against main: none"),
    }

    Ok(0)
}

/// Run the configured checker once, outside the loop. Exit code mirrors the
/// outcome: 0 clean, 1 findings, 2 checker failure.
pub fn check(root: &Path, _config: &Config) -> Result<i32> {
    let harness_config =
        bork::config::load(root).context("failed to load .config/bork.json")?;

    let Some(checker) = &harness_config.correctness_checker else {
        println!("no correctness checker configured");
        return Ok(0);
    };

    match bork::checker::run(root, checker) {
        CheckerOutcome::Clean => {
            println!("✓ checker reported a clean tree");
            Ok(0)
        }
        CheckerOutcome::Findings(report) => {
            println!("checker reported {} finding(s):", report.finding_count());
            for finding in report.iter() {
                println!("- {}", describe_finding(finding));
            }
            Ok(1)
        }
        CheckerOutcome::Failed(finding) => {
            eprintln!("✗ checker failed: {}", describe_finding(&finding));
            Ok(2)
        }
    }
}
