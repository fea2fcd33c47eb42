//! # AskMyNotes CLI (`notes`)
//!
//! Ingest study notes into subjects and ask grounded questions about them,
//! either from the terminal or through the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! notes --config ./config/notes.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `notes init` | Create the SQLite database and run schema migrations |
//! | `notes subjects` | List subjects with document and passage counts |
//! | `notes documents <subject>` | List the documents of a subject |
//! | `notes ingest <subject> <paths>...` | Ingest files or directories into a subject |
//! | `notes ask <subject> "<question>"` | Answer a question from a subject's notes |
//! | `notes remove <document-id>` | Remove a document and its passages |
//! | `notes serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! notes init
//! notes ingest subject1 ~/notes/biology
//! notes ask subject1 "Where does photosynthesis happen?"
//! notes ask subject1 "Explain osmosis" --teacher --json
//! notes serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use askmynotes::{cli, config, ingest, server};

#[derive(Parser)]
#[command(
    name = "notes",
    about = "AskMyNotes: grounded answers from your own study notes",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/notes.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database (create tables)
    Init,

    /// List subjects and their corpus sizes
    Subjects,

    /// List the documents ingested into a subject
    Documents {
        /// Subject id
        subject: String,
    },

    /// Ingest files or directories into a subject
    Ingest {
        /// Subject id
        subject: String,

        /// Files or directories; directories are filtered by [ingest].include_globs
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// List the files that would be ingested without ingesting them
        #[arg(long)]
        dry_run: bool,
    },

    /// Ask a question about a subject's notes
    Ask {
        /// Subject id
        subject: String,

        /// The question
        question: String,

        /// Answer conversationally and end with a follow-up question
        #[arg(long)]
        teacher: bool,

        /// Print the answer record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove a document and its passages
    Remove {
        /// Document id (UUID)
        document_id: String,
    },

    /// Start the HTTP server (/upload, /ask, /ask_v2, /teacher_ask)
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => cli::run_init(&cfg).await?,
        Commands::Subjects => cli::run_subjects(&cfg).await?,
        Commands::Documents { subject } => cli::run_documents(&cfg, &subject).await?,
        Commands::Ingest {
            subject,
            paths,
            dry_run,
        } => ingest::run_ingest(&cfg, &subject, &paths, dry_run).await?,
        Commands::Ask {
            subject,
            question,
            teacher,
            json,
        } => cli::run_ask(&cfg, &subject, &question, teacher, json).await?,
        Commands::Remove { document_id } => cli::run_remove(&cfg, &document_id).await?,
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}
