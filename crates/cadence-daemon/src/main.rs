use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod adhoc;
mod cli;
mod daemon;
mod exit;
mod history;
mod signal;

use cli::{Cli, Commands, LogFormat};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.config.as_deref();
    let outcome = match cli.command {
        Commands::Daemon => daemon::run(config).await.map(|()| 0),
        Commands::Run {
            task,
            stdin,
            record,
            stdout,
            stderr,
        } => {
            let captures = adhoc::Captures { stdout, stderr };
            adhoc::run_task(config, &task, stdin.as_deref(), record, captures).await
        }
        Commands::Exec {
            timeout,
            stdin,
            program,
            args,
        } => adhoc::exec_program(config, &program, args, timeout, stdin.as_deref()).await,
        Commands::History { action } => history::run(config, action).map(|()| 0),
        Commands::Check => history::check(config).map(|()| 0),
    };

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit::for_error(&e))
        }
    }
}

/// Logs go to stderr so stdout stays clean for command output.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cadence=info,cadence_scheduler=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
