//! tagmine service binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tagmine::Orchestrator;
use tagmine_adapters::{ReplayAdapter, ReplayOptions, SimPoint, SimulatedHistorian};
use tagmine_config::{load_config, TagmineConfig};
use tagmine_core::{DataSourceId, SourceKind, TagmineError, TagmineResult};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tagmine", version, about = "Industrial time-series ingestion and equipment pattern mining")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service until interrupted
    Run,
    /// Load and validate the configuration, then print the effective values
    CheckConfig,
    /// Feed a simulated air-handling unit through the full pipeline and
    /// print the resulting suggestions
    Demo {
        /// How long to let the simulation run
        #[arg(long, default_value_t = 30)]
        duration_s: u64,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn load(cli_config: Option<&PathBuf>) -> TagmineResult<TagmineConfig> {
    load_config(cli_config.map(PathBuf::as_path))
        .map_err(|e| TagmineError::Configuration(e.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::CheckConfig => {
            let config = load(cli.config.as_ref())?;
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| TagmineError::Configuration(e.to_string()))?;
            println!("{}", rendered);
        }
        Command::Run => {
            let config = load(cli.config.as_ref())?;
            run_service(config).await?;
        }
        Command::Demo { duration_s } => {
            let mut config = load(cli.config.as_ref())?;
            tune_for_demo(&mut config);
            run_demo(config, Duration::from_secs(duration_s)).await?;
        }
    }
    Ok(())
}

async fn run_service(config: TagmineConfig) -> TagmineResult<()> {
    let mut orchestrator = Orchestrator::new(config)?;

    // Reattach adapters for previously registered replay sources; other
    // source kinds are registered through the admin surfaces at runtime
    for source in orchestrator.meta.list_data_sources()? {
        if source.kind == SourceKind::Replay && !source.connection.is_empty() {
            let paths: Vec<PathBuf> = source
                .connection
                .split(',')
                .map(|p| PathBuf::from(p.trim()))
                .collect();
            match ReplayAdapter::from_files(
                source.name.clone(),
                source.id,
                &paths,
                ReplayOptions::default(),
            ) {
                Ok(adapter) => {
                    orchestrator
                        .register_adapter(Arc::new(adapter), false)
                        .await?;
                }
                Err(e) => {
                    tracing::error!(source = %source.name, error = %e, "replay source failed to load");
                }
            }
        }
    }

    orchestrator.start()?;
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| TagmineError::Configuration(format!("signal handler failed: {}", e)))?;
    orchestrator.shutdown().await
}

/// Shrink every damping interval so the flywheel turns within seconds
fn tune_for_demo(config: &mut TagmineConfig) {
    config.adapter.poll_interval_ms = 200;
    config.behavior.min_samples_for_behavior = 20;
    config.behavior.publish_interval_s = 2;
    config.correlation.min_overlap = 20;
    config.correlation.significant_r = 0.7;
    config.clustering.scan_interval_s = 2;
    config.matching.min_overall = 0.4;
}

async fn run_demo(config: TagmineConfig, duration: Duration) -> TagmineResult<()> {
    let data_dir = tempfile::tempdir()
        .map_err(|e| TagmineError::Configuration(format!("demo temp dir: {}", e)))?;
    let mut config = config;
    config.service.data_dir = data_dir.path().to_string_lossy().into_owned();

    let mut orchestrator = Orchestrator::new(config)?;

    // One simulated air-handling unit: supply/return temperatures share a
    // slow wave (strongly correlated), the fan status rides the same wave
    let ds = DataSourceId::new();
    let historian = Arc::new(
        SimulatedHistorian::new("demo-historian", ds)
            .with_point(
                SimPoint::analog("hvac.ahu1.sat", 14.0, 3.0, 60.0)
                    .with_unit("degC")
                    .with_description("Supply air temperature")
                    .with_noise(0.05),
            )
            .with_point(
                SimPoint::analog("hvac.ahu1.rat", 22.0, 2.5, 60.0)
                    .with_unit("degC")
                    .with_description("Return air temperature")
                    .with_noise(0.05),
            )
            .with_point(
                SimPoint::analog("hvac.ahu1.sf_status", 0.5, 0.5, 60.0)
                    .with_description("Supply fan run status"),
            ),
    );
    let discovered = orchestrator.register_adapter(historian, true).await?;
    println!("discovered and registered {} points", discovered);

    orchestrator.start()?;
    println!("flywheel running for {:?}...", duration);
    tokio::time::sleep(duration).await;

    let suggestions = orchestrator.meta.pending_suggestions()?;
    if suggestions.is_empty() {
        println!("no suggestions yet; try a longer --duration-s");
    }
    for suggestion in &suggestions {
        println!(
            "suggestion {}: pattern '{}' overall {:.2} ({} points)",
            suggestion.id,
            suggestion.pattern_name,
            suggestion.overall,
            suggestion.matched_points.len()
        );
        for line in &suggestion.evidence {
            println!("  {}", line);
        }
    }

    orchestrator.shutdown().await
}
