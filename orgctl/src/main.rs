//! orgctl CLI - account control plane command-line interface
//!
//! Evaluates account specs against a saved session, encodes and decodes
//! control records, and runs the ownership race harness.

use clap::{Parser, Subcommand};
use orgctl_lib::Config;
use std::path::PathBuf;
use std::process;

mod commands;

#[derive(Parser)]
#[command(name = "orgctl")]
#[command(author, version, about = "Multi-account organization control plane", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Accounts processed concurrently by bulk operations
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print accounts of a saved session that match an account spec
    Select {
        /// Account spec, e.g. "owner=me,dev,!prod"
        spec: String,

        /// Session file
        #[arg(long)]
        session: PathBuf,

        /// Name substituted for "me" (default: the session name)
        #[arg(long)]
        user: Option<String>,
    },

    /// Encode or decode control records
    #[command(subcommand)]
    Ctl(CtlCommands),

    /// Race workers for one account and report lost updates
    Race(commands::race::RaceArgs),
}

#[derive(Subcommand)]
enum CtlCommands {
    /// Encode a control record
    Encode {
        #[arg(long)]
        owner: Option<String>,

        #[arg(long)]
        desc: Option<String>,

        /// Tag to set (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Decode a control record and print it as JSON
    Decode {
        /// Encoded record, e.g. "1#e30="
        record: String,
    },
}

fn config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(n) = cli.concurrency {
        config = config.with_concurrency(n);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.clone())
        .with_writer(std::io::stderr)
        .init();

    let result = match config(&cli) {
        Ok(config) => match cli.command {
            Commands::Select { spec, session, user } => {
                commands::select::run(config, &spec, &session, user.as_deref()).await
            }
            Commands::Ctl(CtlCommands::Encode { owner, desc, tags }) => {
                commands::ctl::encode(owner.as_deref(), desc.as_deref(), &tags)
            }
            Commands::Ctl(CtlCommands::Decode { record }) => commands::ctl::decode(&record),
            Commands::Race(args) => commands::race::run(config, &args).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
