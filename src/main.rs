//! toolgate — hook entry points.
//!
//! Invoked by the host once per event with a JSON payload on stdin.
//! Exit-code contract: 0 = pass (the tool may proceed), 2 = block (the
//! host must refuse the call). `track` and `session-end` always exit 0.

use clap::{Parser, Subcommand};
use std::io::Read;
use toolgate::config::Paths;
use toolgate::dispatch::{enforce, EnforcerDecision};
use toolgate::session_end::finish_session;
use toolgate::tracker::track;
use tracing_subscriber::EnvFilter;

/// Exit code telling the host to refuse the tool call.
const EXIT_BLOCK: i32 = 2;

#[derive(Parser)]
#[command(name = "toolgate")]
#[command(about = "Policy enforcement and self-healing middleware for LLM agent tool calls")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// PreToolUse: evaluate the gate pipeline, possibly blocking the call
    Enforce,
    /// PostToolUse: update observational state, never blocks
    Track,
    /// SessionEnd: flush queues, bump counters, emit a summary
    SessionEnd,
}

fn main() {
    // Diagnostics go to stderr; stdout is reserved for hook decisions.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = Paths::resolve();
    paths.ensure_dirs();

    let mut raw_input = String::new();
    let _ = std::io::stdin().read_to_string(&mut raw_input);

    match cli.command {
        Commands::Enforce => {
            let outcome = enforce(&paths, &raw_input);
            for warning in &outcome.warnings {
                eprintln!("{warning}");
            }
            match outcome.decision {
                EnforcerDecision::Pass => {}
                EnforcerDecision::Ask(decision) => {
                    println!("{decision}");
                }
                EnforcerDecision::Block(message) => {
                    eprintln!("{message}");
                    std::process::exit(EXIT_BLOCK);
                }
            }
        }
        Commands::Track => {
            for note in track(&paths, &raw_input) {
                eprintln!("{note}");
            }
        }
        Commands::SessionEnd => {
            let summary = finish_session(&paths, &raw_input);
            println!("{summary}");
        }
    }
}
