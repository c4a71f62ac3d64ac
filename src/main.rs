use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{self, EnvFilter};

use parqed::cli::{self, Cli};

/// Exit code for an external interruption (SIGINT), per convention 128+2.
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Daemonized commands own their signal handling; one-shot commands are
    // raced against Ctrl-C so an interrupted run reports exit code 130.
    if cli.command.is_daemon() {
        run_to_exit_code(cli::run(cli).await)
    } else {
        tokio::select! {
            result = cli::run(cli) => run_to_exit_code(result),
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted");
                ExitCode::from(EXIT_INTERRUPTED)
            }
        }
    }
}

fn run_to_exit_code(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
