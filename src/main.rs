use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "bork")]
#[command(
    about = "Reconciles a repository against its specifications by querying an LLM under a safety policy",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "Enable verbose debug output")]
    verbose: bool,

    #[arg(
        long,
        global = true,
        help = "Validate proposed edits without applying them"
    )]
    dry_run: bool,

    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Path to the repository root"
    )]
    repo_root: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the reconciliation loop (snapshot, query, vet, commit, check)")]
    Reconcile {
        #[arg(
            long,
            default_value_t = 5,
            help = "Maximum reconciliation iterations (hard cap 5)"
        )]
        max_iterations: u32,
    },

    #[command(about = "Print the repository snapshot as the model would see it")]
    Snapshot,

    #[command(about = "Run the configured correctness checker once and print its findings")]
    Check,
}

// Exit codes: 0 reconciliation clean, 1 escalated to a human with findings
// outstanding, 2 error (malformed config, unreachable LLM, failed checker).
#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = cli::Config {
        verbose: cli.verbose,
        dry_run: cli.dry_run,
    };

    let result = match cli.command {
        Commands::Reconcile { max_iterations } => {
            cli::reconcile(&cli.repo_root, max_iterations, &config).await
        }
        Commands::Snapshot => cli::snapshot(&cli.repo_root, &config),
        Commands::Check => cli::check(&cli.repo_root, &config),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("✗ {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_reconcile_with_iteration_limit() {
        let cli = Cli::try_parse_from(["bork", "reconcile", "--max-iterations", "3"])
            .expect("cli parse");
        match cli.command {
            Commands::Reconcile { max_iterations } => assert_eq!(max_iterations, 3),
            _ => panic!("unexpected command variant"),
        }
        assert!(!cli.dry_run);
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["bork", "snapshot", "--verbose", "--repo-root", "/tmp/r"])
            .expect("cli parse");
        assert!(cli.verbose);
        assert_eq!(cli.repo_root, PathBuf::from("/tmp/r"));
        assert!(matches!(cli.command, Commands::Snapshot));
    }

    #[test]
    fn reconcile_defaults_to_the_hard_cap() {
        let cli = Cli::try_parse_from(["bork", "reconcile"]).expect("cli parse");
        match cli.command {
            Commands::Reconcile { max_iterations } => assert_eq!(max_iterations, 5),
            _ => panic!("unexpected command variant"),
        }
    }
}
