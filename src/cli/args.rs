use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "interview-capture")]
#[command(
    about = "Sends a bot to interview meetings, analyzes the recording and delivers a report",
    long_about = None
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Register a meeting and run it to completion right away
    Manual(ManualCliArgs),
    /// Run the scheduler, inbox watcher and HTTP API (default)
    Monitor,
    /// Inspect and manage meetings
    Meetings(MeetingsCliArgs),
    /// Onboard and look up interviewers
    Users(UsersCliArgs),
    /// Print version information
    Version,
}

#[derive(ClapArgs, Debug)]
pub struct ManualCliArgs {
    /// Meeting join URL
    #[arg(long)]
    pub url: String,
    /// Email of the interviewer who receives the report
    #[arg(long)]
    pub owner: String,
    #[arg(long)]
    pub title: Option<String>,
    /// Scheduled start (RFC 3339), defaults to now
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(ClapArgs, Debug)]
pub struct MeetingsCliArgs {
    #[command(subcommand)]
    pub command: MeetingsCommand,
}

#[derive(Subcommand, Debug)]
pub enum MeetingsCommand {
    /// List recent meetings
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Only show meetings in this status (e.g. `recording`, `failed`)
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Show a meeting with its artifacts
    Show { id: i64 },
    /// Force a meeting to failed(cancelled)
    Cancel {
        id: i64,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Remove a meeting and its analysis results
    Delete { id: i64 },
}

#[derive(ClapArgs, Debug)]
pub struct UsersCliArgs {
    #[command(subcommand)]
    pub command: UsersCommand,
}

#[derive(Subcommand, Debug)]
pub enum UsersCommand {
    /// Onboard an interviewer (idempotent per email)
    Onboard {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        role: Option<String>,
    },
    /// Show an onboarded interviewer
    Show { email: String },
}
