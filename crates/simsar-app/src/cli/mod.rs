use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "simsar",
    version,
    about = "Multilingual real-estate intake pipeline"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP API server.
    Serve,
    /// Manage intake sessions.
    Session(SessionArgs),
    /// Run detection and extraction over a stored session.
    Process(ProcessArgs),
    /// Confirm a reviewed session into a canonical record.
    Confirm(ConfirmArgs),
}

#[derive(Debug, Args)]
pub struct SessionArgs {
    #[command(subcommand)]
    pub command: SessionCommands,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommands {
    /// Capture a new intake session from text or a file.
    Add(SessionAddArgs),
    /// Print one session as JSON.
    Show(SessionShowArgs),
    /// List sessions waiting in the review queue.
    Queue(SessionQueueArgs),
}

#[derive(Debug, Args)]
pub struct SessionAddArgs {
    /// Raw listing/requirement/contact text.
    #[arg(long, conflicts_with = "file")]
    pub text: Option<String>,
    /// Read the raw text from a file instead.
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// Media files to attach to the session.
    #[arg(long = "media", value_name = "PATH")]
    pub media: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SessionShowArgs {
    /// Session id.
    pub id: String,
}

#[derive(Debug, Args)]
pub struct SessionQueueArgs {
    /// Maximum sessions to list.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Session id to process.
    pub session: String,
    /// Skip classification and extract with this type.
    #[arg(long = "force-type", value_enum)]
    pub force_type: Option<RecordTypeArg>,
    /// Actor charged for the model-call budget.
    #[arg(long, default_value = "cli")]
    pub actor: String,
}

#[derive(Debug, Args)]
pub struct ConfirmArgs {
    /// Session id to confirm.
    pub session: String,
    /// Confirmation mode.
    #[arg(long, value_enum, default_value_t = ConfirmModeArg::CreateNew)]
    pub mode: ConfirmModeArg,
    /// Target record id, required with --mode update-existing.
    #[arg(long)]
    pub target: Option<String>,
    /// Override the record type instead of using the detected one.
    #[arg(long = "record-type", value_enum)]
    pub record_type: Option<RecordTypeArg>,
    /// Reviewed field map as inline JSON; defaults to the session's
    /// normalized fields.
    #[arg(long = "fields-json")]
    pub fields_json: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecordTypeArg {
    Sale,
    Rent,
    Buyer,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfirmModeArg {
    CreateNew,
    UpdateExisting,
}
