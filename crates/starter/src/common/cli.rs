use std::path::PathBuf;

use clap::Parser;

use crate::common::env::{STARTER_DB, STARTER_DEBUG};

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Enables more detailed log output
    #[arg(
        short,
        long,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub verbose: bool,

    /// Keeps the temporary folder of the task after the run
    #[arg(
        long,
        env = STARTER_DEBUG,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,

    /// Result database (SQLite)
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        env = STARTER_DB,
        global = true,
        help_heading("GLOBAL OPTIONS")
    )]
    pub db: Option<PathBuf>,

    /// JSON exit code table, used when the database provides none
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        help_heading("GLOBAL OPTIONS")
    )]
    pub exit_codes: Option<PathBuf>,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::STARTER_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Run all subtasks of a job configuration
    Run(RunOpts),
    /// Validate a job configuration and print the resolved subtasks
    Check(CheckOpts),
    /// Print the effective exit code table
    ExitCodes,
    /// Print a result stored in the database
    Report(ReportOpts),
}

#[derive(Parser)]
pub struct RunOpts {
    /// Job configuration (JSON)
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub job: PathBuf,

    /// Prepare the task folder and print the commands without starting them
    #[arg(long)]
    pub dry_run: bool,

    /// Overrides the watchdog cycle length, e.g. `10s`
    #[arg(long)]
    pub cycle: Option<humantime::Duration>,

    /// Overrides the startup grace period of every subtask, e.g. `2m`
    #[arg(long)]
    pub initial_wait: Option<humantime::Duration>,

    /// Time given to each step of the shutdown sequence
    #[arg(long, default_value = "2m")]
    pub cancel_grace: humantime::Duration,

    /// JSON file with confidence filter settings
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub filter_config: Option<PathBuf>,
}

#[derive(Parser)]
pub struct CheckOpts {
    /// Job configuration (JSON)
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub job: PathBuf,
}

#[derive(Parser)]
pub struct ReportOpts {
    /// Name of the task
    #[arg(long)]
    pub task: String,
}
