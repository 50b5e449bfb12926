//! Fine-tune a token classifier on KLUE NER.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use klue_ner_core::TrainConfig;
use klue_ner_trainer::run_training;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// CLI arguments
#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Fine-tune a BERT token classifier on KLUE NER")]
#[command(version)]
struct Cli {
    /// Run configuration (TOML with a `[CFG]` table)
    #[arg(short, long, env = "KLUE_NER_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Override the output directory
    #[arg(short, long, env = "KLUE_NER_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn run(cli: Cli) -> Result<()> {
    let mut config = TrainConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(dir) = cli.output_dir {
        config.output_dir = Some(dir);
    }

    info!(
        model = %config.plm,
        dataset = %config.dset_name,
        output = %config.output_dir().display(),
        "Loaded configuration"
    );
    let report = run_training(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        eprintln!("Training failed: {:#}", e);
        std::process::exit(1);
    }
}
