use anyhow::Result;
use clap::Parser;
use interview_capture::{
    app,
    cli::{handle_manual_command, handle_meetings_command, handle_users_command, Cli, CliCommand},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Some(CliCommand::Version) => {
            println!("interview-capture {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(CliCommand::Manual(args)) => handle_manual_command(args).await,
        Some(CliCommand::Meetings(args)) => handle_meetings_command(args).await,
        Some(CliCommand::Users(args)) => handle_users_command(args).await,
        Some(CliCommand::Monitor) | None => app::run_monitor().await,
    }
}
