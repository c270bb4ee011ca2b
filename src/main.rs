//! CLI entry point for ewc-continual-rs.

use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ewc_continual_rs::{ContinualConfig, ContinualTrainer, Ewc, Result};

#[derive(Parser)]
#[command(name = "ewc-train")]
#[command(about = "Continual fine-tuning with Elastic Weight Consolidation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Train every configured task in order
    Train {
        /// Path to configuration file
        config: String,
        /// Override ewc.lambda
        #[arg(long)]
        lambda: Option<f64>,
        /// Train without the EWC penalty
        #[arg(long)]
        no_ewc: bool,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (moderation, tiny)
        #[arg(long, default_value = "moderation")]
        preset: String,
    },
    /// Summarise a saved EWC state file
    Inspect {
        /// Path to ewc.safetensors
        path: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = ContinualConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Tasks: {}", config.tasks.len());
            for task in &config.tasks {
                println!("    - {} ({})", task.name, task.path);
            }
            println!("  Labels: {}", config.dataset.labels.join(", "));
            println!(
                "  EWC: {} (lambda {})",
                if config.ewc.enabled { "on" } else { "off" },
                config.ewc.lambda
            );
        }
        Commands::Train {
            config,
            lambda,
            no_ewc,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let mut config = ContinualConfig::from_file(&config)?;
            if let Some(lambda) = lambda {
                config.ewc.lambda = lambda;
            }
            if no_ewc {
                config.ewc.enabled = false;
            }

            let trainer = ContinualTrainer::new(config)?;
            let reports = trainer.run()?;
            for report in &reports {
                let last = report.epochs.last().map_or(f64::NAN, |e| e.average_loss);
                println!("✓ {} (final loss {:.4})", report.task, last);
                for eval in &report.evaluations {
                    println!("    accuracy on {}: {:.3}", eval.task, eval.accuracy);
                }
            }
            println!("✓ Outputs written to: {}", trainer.config().output_dir);
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = ContinualConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Inspect { path } => {
            let ewc = Ewc::load(&path, &Device::Cpu)?;
            println!("✓ EWC state: {} parameters", ewc.fisher().len());
            for (name, total) in ewc.fisher().totals()? {
                let shape = ewc
                    .snapshot()
                    .get(&name)
                    .map(|t| format!("{:?}", t.dims()))
                    .unwrap_or_default();
                println!("  {name} {shape} fisher total {total:.6e}");
            }
        }
    }

    Ok(())
}
