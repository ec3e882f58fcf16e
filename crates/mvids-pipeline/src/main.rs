//! `mvids`: train and evaluate the multi-view intrusion detection pipeline.
//!
//! ```text
//! mvids train --data flows.csv --config mvids.yaml --out-dir runs/latest
//! mvids evaluate --results runs/latest/results.csv --classes BENIGN,DoS,PortScan
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mvids_core::config::LoggingConfig;
use mvids_core::{load_config, PipelineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mvids", version, about = "Multi-view intrusion detection pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline on a labelled flow table.
    Train {
        /// YAML configuration file (defaults are used when omitted).
        #[arg(long, env = "MVIDS_CONFIG")]
        config: Option<PathBuf>,

        /// CSV file with one flow per row and a label column.
        #[arg(long)]
        data: PathBuf,

        /// Directory for the features table, results, models and summary.
        #[arg(long, default_value = "runs/latest")]
        out_dir: PathBuf,

        /// Override the configured seed.
        #[arg(long)]
        seed: Option<u64>,

        /// Run on the CPU even when built with a GPU back end.
        #[arg(long)]
        cpu: bool,
    },
    /// Recompute metrics from a results table.
    Evaluate {
        /// Results CSV written by `train`.
        #[arg(long)]
        results: PathBuf,

        /// Class names in id order, comma separated.
        #[arg(long, value_delimiter = ',')]
        classes: Option<Vec<String>>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            data,
            out_dir,
            seed,
            cpu,
        } => {
            let mut pipeline_config = match &config {
                Some(path) => load_config(path)?,
                None => PipelineConfig::default(),
            };
            if let Some(seed) = seed {
                pipeline_config.data.seed = seed;
            }
            if cpu {
                pipeline_config.training.force_cpu = true;
            }
            init_tracing(&pipeline_config.logging);
            match &config {
                Some(path) => info!(path = %path.display(), "Loaded configuration"),
                None => info!("No config file specified, using defaults"),
            }

            let summary = mvids_pipeline::run(&pipeline_config, &data, &out_dir)?;
            println!("{}", summary.metrics);
            println!(
                "fallbacks={} router_weights={:?}",
                summary.fallback_count, summary.mean_router_weights
            );
            println!("Artifacts written to {}", out_dir.display());
        }
        Command::Evaluate { results, classes } => {
            init_tracing(&LoggingConfig::default());
            let metrics = mvids_pipeline::evaluate_results(&results, classes)?;
            println!("{metrics}");
        }
    }

    Ok(())
}
