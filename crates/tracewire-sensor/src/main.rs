//! tracewire - kernel event pipelines
//!
//! Runs configured gadget pipelines and prints or stores their records.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracewire_core::config::{ConfigLoader, ExportKind, SensorConfig, SensorSettings};
use tracewire_core::{PipelineStats, Registry, TRACEWIRE_VERSION};
use tracewire_sensor::{
    build_registry, logging, synthetic_runtime, write_default_config, write_metrics,
};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "tracewire")]
#[command(version)]
#[command(about = "Decode and enrich kernel event streams", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "TRACEWIRE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured pipeline until interrupted
    Run,

    /// Run the configured pipelines against generated events
    Demo {
        /// Event generation interval in milliseconds
        #[arg(long)]
        interval: Option<u64>,

        /// Events per pipeline (0 = infinite)
        #[arg(long)]
        count: Option<u64>,
    },

    /// Show configuration and pipelines
    Status,

    /// Write the default configuration file
    Init {
        /// Destination; defaults to --config or the user config directory
        path: Option<PathBuf>,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // `init` must work before any configuration exists
    if let Commands::Init { path, force } = &cli.command {
        logging::init(cli.verbose, &SensorSettings::default())?;
        return init_command(path.as_deref().or(cli.config.as_deref()), *force);
    }

    let loaded = ConfigLoader::new().with_cli_path(cli.config.clone()).load();
    let settings = loaded
        .as_ref()
        .map(|config| config.sensor.clone())
        .unwrap_or_default();
    logging::init(cli.verbose, &settings)?;

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    match cli.command {
        Commands::Run => run_command(config).await,
        Commands::Demo { interval, count } => demo_command(config, interval, count).await,
        Commands::Status => status_command(&config),
        Commands::Init { .. } => Ok(()),
    }
}

fn init_command(path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => ConfigLoader::default_config_path()
            .context("No user config directory on this platform, pass a path")?,
    };
    write_default_config(&path, force)?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn run_command(config: SensorConfig) -> anyhow::Result<()> {
    info!("Starting tracewire v{}...", TRACEWIRE_VERSION);
    let registry = build_registry(&config, synthetic_runtime(&config.run))?;
    run_registry(registry, &config.sensor).await
}

/// Demo mode: generated events, no kernel instrumentation required
async fn demo_command(
    mut config: SensorConfig,
    interval: Option<u64>,
    count: Option<u64>,
) -> anyhow::Result<()> {
    if let Some(interval) = interval {
        config.demo.interval_ms = interval;
    }
    match count {
        Some(0) => config.demo.count = None,
        Some(n) => config.demo.count = Some(n),
        None => {}
    }

    eprintln!();
    eprintln!("  tracewire v{} - DEMO MODE", TRACEWIRE_VERSION);
    eprintln!();
    eprintln!("  Generating events every {}ms", config.demo.interval_ms);
    match config.demo.count {
        Some(n) => eprintln!("  Will generate {} events per pipeline", n),
        None => eprintln!("  Generating events indefinitely"),
    }
    eprintln!("  Press Ctrl+C to stop");
    eprintln!();

    let registry = build_registry(&config, synthetic_runtime(&config.demo))?;
    run_registry(registry, &config.sensor).await
}

async fn run_registry(registry: Registry, settings: &SensorSettings) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let stats: Vec<(String, Arc<PipelineStats>)> = registry
        .names()
        .filter_map(|name| Some((name.to_string(), registry.stats(name)?)))
        .collect();

    let mut failures = registry.subscribe_failures();
    tokio::spawn(async move {
        loop {
            match failures.recv().await {
                Ok(f) => warn!(
                    "[{}/{}] {} failed: {}",
                    f.pipeline, f.stream, f.operator, f.error
                ),
                Err(RecvError::Lagged(n)) => warn!("{} record failures not reported", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = signal_cancel.cancelled() => {}
            received = shutdown_signal() => {
                match received {
                    Ok(name) => info!("Received {}, shutting down...", name),
                    Err(e) => error!("Failed to listen for shutdown signals: {}", e),
                }
                signal_cancel.cancel();
            }
        }
    });

    if let Some(secs) = settings.run_timeout_secs {
        let timeout_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timeout_cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("Run timeout of {}s reached, shutting down...", secs);
                    timeout_cancel.cancel();
                }
            }
        });
    }

    let result = registry.run_all(cancel.clone()).await;
    cancel.cancel();

    if let Some(path) = &settings.metrics_path {
        if let Err(e) = write_metrics(path, &stats) {
            warn!("Failed to write metrics to {}: {}", path.display(), e);
        }
    }

    match result {
        Ok(report) => {
            for (name, stats) in &report.pipelines {
                info!(
                    "Pipeline {}: {} received, {} delivered, {} dropped, {} failed",
                    name,
                    stats.events_received,
                    stats.events_delivered,
                    stats.events_dropped,
                    stats.events_failed
                );
            }
            info!("tracewire stopped");
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            received = tokio::signal::ctrl_c() => received.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "Ctrl+C")
    }
}

fn status_command(config: &SensorConfig) -> anyhow::Result<()> {
    println!();
    println!("tracewire v{}", TRACEWIRE_VERSION);
    println!();
    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    println!("Log level: {}", config.sensor.log_level);
    if let Some(path) = &config.sensor.metrics_path {
        println!("Metrics file: {}", path.display());
    }
    match config.sensor.run_timeout_secs {
        Some(secs) => println!("Run timeout: {}s", secs),
        None => println!("Run timeout: none"),
    }
    println!(
        "Local manager: {} ({})",
        if config.local_manager.enabled {
            "enabled"
        } else {
            "disabled"
        },
        config.local_manager.proc_root.display()
    );

    println!();
    println!("Pipelines:");
    for pipeline in &config.pipelines {
        let export = match pipeline.export.kind {
            ExportKind::Stdout => "stdout".to_string(),
            ExportKind::Jsonl => match &pipeline.export.path {
                Some(path) => format!("jsonl ({})", path.display()),
                None => "jsonl".to_string(),
            },
            ExportKind::Discard => "none".to_string(),
        };
        println!(
            "  {:<12} gadget={} operators=[{}] export={}",
            pipeline.name,
            pipeline.gadget,
            pipeline.operators.join(", "),
            export
        );
    }

    println!();
    println!("Effective configuration:");
    println!();
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
