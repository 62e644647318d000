use std::io::{self, Write};

use crate::actions::Action;

/// The human-approval seam. Called once per approval-required action with
/// the full proposed mutation; a `false` verdict drops the action. Verdicts
/// are never cached across iterations.
pub trait ApprovalGate {
    fn review(&self, action: &Action) -> io::Result<bool>;
}

/// Interactive gate that shows the proposed edit and reads a yes/no from
/// stdin.
pub struct StdinApproval;

impl ApprovalGate for StdinApproval {
    fn review(&self, action: &Action) -> io::Result<bool> {
        println!("\n{}", "=".repeat(60));
        match action {
            Action::CreateOrUpdate { path, contents } => {
                println!("The model proposes to write {}:", path);
                println!("{}", "-".repeat(60));
                println!("{}", String::from_utf8_lossy(contents));
                println!("{}", "-".repeat(60));
            }
            Action::Delete { path } => {
                println!("The model proposes to delete {}.", path);
            }
        }
        print!("Approve this edit? [y/N]: ");
        io::stdout().flush()?;

        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        let answer = answer.trim();
        Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
    }
}
