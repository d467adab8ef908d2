//! CipherScope CLI - identify the cryptographic algorithm behind a capture
//!
//! The `cipherscope` command trains models from labeled samples, manages the
//! model registry and classifies new uploads through the job service.

mod commands;
mod config;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, shells};
use cipherscope_core::CipherScope;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{classify, jobs, models, train, JobsCommand, ModelsCommand, SampleArg};

const DEFAULT_LOG_LEVEL: Level = Level::WARN;

/// CipherScope - cryptographic algorithm identification
#[derive(Parser, Debug)]
#[command(
    name = "cipherscope",
    author,
    version,
    about = "CipherScope - cryptographic algorithm identification",
    long_about = "CipherScope trains lightweight classifiers on labeled ciphertext samples and uses the active model\nto identify the algorithm behind new captures."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Configuration file (overrides CIPHERSCOPE_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for models and job history (overrides CIPHERSCOPE_DATA_DIR)
    #[arg(short = 'd', long, global = true)]
    data_dir: Option<PathBuf>,

    /// Name recorded as the owner of submitted jobs (defaults to $USER)
    #[arg(long, global = true)]
    owner: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify a capture with the active model
    ///
    /// Uploads are csv, json or txt. The format defaults to the file extension.
    Classify {
        /// Capture to classify
        file: PathBuf,

        /// Declared format (csv, json, txt)
        #[arg(long)]
        format: Option<String>,

        /// Algorithm you believe produced the capture; the result reports whether it matches
        #[arg(long)]
        known_algorithm: Option<String>,

        /// Output the job status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Train a model from labeled samples
    ///
    /// Needs at least two distinct labels. The new model is registered but not
    /// activated unless --activate is given.
    Train {
        /// Labeled sample as LABEL=PATH (repeatable)
        #[arg(long = "sample", required = true)]
        samples: Vec<SampleArg>,

        /// Warm-start from an existing model
        #[arg(long)]
        base_model: Option<String>,

        /// Activate the model if it passes validation
        #[arg(long)]
        activate: bool,

        /// Output the job status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Model registry operations
    #[command(subcommand)]
    Models(ModelsCommand),

    /// Job history and feedback
    #[command(subcommand)]
    Jobs(JobsCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Handle completion generation
    if let Ok(shell) = std::env::var("CIPHERSCOPE_GENERATE_COMPLETIONS") {
        let mut cmd = Args::command();
        match shell.as_str() {
            "bash" => generate(shells::Bash, &mut cmd, "cipherscope", &mut std::io::stdout()),
            "zsh" => generate(shells::Zsh, &mut cmd, "cipherscope", &mut std::io::stdout()),
            "fish" => generate(shells::Fish, &mut cmd, "cipherscope", &mut std::io::stdout()),
            _ => {
                eprintln!("Unknown shell: {}. Supported: bash, zsh, fish", shell);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let args = Args::parse();
    let config = config::load_config(args.config.as_deref(), args.data_dir.clone())?;

    let level = args
        .log_level
        .as_deref()
        .or(config.log_level.as_deref())
        .and_then(|l| l.parse::<Level>().ok())
        .unwrap_or(DEFAULT_LOG_LEVEL);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // If no command provided, show help
    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let service = CipherScope::open(config)?;
    let owner = args.owner.or_else(|| std::env::var("USER").ok());

    match command {
        Command::Classify { file, format, known_algorithm, json } => {
            classify::execute(&service, owner.as_deref(), file, format, known_algorithm, json).await?;
        }
        Command::Train { samples, base_model, activate, json } => {
            train::execute(&service, owner.as_deref(), samples, base_model, activate, json).await?;
        }
        Command::Models(cmd) => models::execute(&service, cmd)?,
        Command::Jobs(cmd) => jobs::execute(&service, cmd)?,
    }

    Ok(())
}
