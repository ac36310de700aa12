//! epi - package, sign and verify evidence archives of recorded workflows.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::*;
use evidence_package::{parse_metric, MetricValue};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "epi")]
#[command(version, about = "Tamper-evident evidence archives for recorded workflows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage signing keys
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Pack a finalized recording directory into an archive
    Pack(PackArgs),

    /// Re-sign an existing archive in place
    Sign {
        /// Archive to sign
        file: PathBuf,

        /// Key name (defaults to EPI_SIGNER or "default")
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Verify integrity and signature of an archive
    Verify {
        /// Archive to verify
        file: PathBuf,

        /// Accept archives without a signature
        #[arg(long)]
        allow_unsigned: bool,

        /// Accept signatures whose signer has no local public key
        #[arg(long)]
        allow_unknown_signer: bool,
    },

    /// List archives in the recordings directory
    Ls,
}

#[derive(Subcommand)]
enum KeysAction {
    /// Generate a new keypair
    Generate {
        #[arg(short, long)]
        name: Option<String>,

        /// Replace an existing key of the same name
        #[arg(long)]
        overwrite: bool,
    },

    /// List stored keys
    List,

    /// Print a public key for distribution
    Export {
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Store a public key received out of band
    Import {
        #[arg(short, long)]
        name: String,

        /// Base64 public key
        key: String,

        #[arg(long)]
        overwrite: bool,
    },
}

#[derive(clap::Args)]
struct PackArgs {
    /// Recording directory (must contain steps.jsonl and env.json)
    dir: PathBuf,

    /// Command line of the recorded run
    #[arg(short, long = "command")]
    cli_command: String,

    /// Output archive (defaults to <recordings dir>/<dir name>_<timestamp>.epi)
    #[arg(short, long)]
    out: Option<PathBuf>,

    #[arg(long)]
    goal: Option<String>,

    #[arg(long)]
    notes: Option<String>,

    /// Metric as key=value, repeatable
    #[arg(long = "metric", value_parser = parse_metric_arg)]
    metrics: Vec<(String, MetricValue)>,

    #[arg(long)]
    approved_by: Option<String>,

    /// Tag, repeatable
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Static viewer file to bundle as viewer.html
    #[arg(long)]
    viewer: Option<PathBuf>,

    /// Leave the archive unsigned
    #[arg(long)]
    no_sign: bool,
}

fn parse_metric_arg(s: &str) -> Result<(String, MetricValue), String> {
    parse_metric(s).map_err(|e| e.to_string())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let config = CliConfig::from_env();

    let result = match cli.command {
        Commands::Keys { action } => commands::keys::run(&config, action).map(|()| true),
        Commands::Pack(args) => commands::pack::run(&config, args).map(|_| true),
        Commands::Sign { file, name } => {
            commands::sign::run(&config, &file, name.as_deref()).map(|()| true)
        }
        Commands::Verify {
            file,
            allow_unsigned,
            allow_unknown_signer,
        } => commands::verify::run(&config, &file, allow_unsigned, allow_unknown_signer),
        Commands::Ls => commands::ls::run(&config).map(|()| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {:#}", "error:".bright_red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
