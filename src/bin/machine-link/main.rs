use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use machine_link::{Config, ConnectionManager, JobState, MachineEvent, Target};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Talk to fabrication machines over SACP, the legacy HTTP api, or serial.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "machine-link")]
struct Cli {
    /// Config file to use. Defaults apply when it doesn't exist.
    #[arg(long, short, default_value = "machine-link.toml")]
    config: PathBuf,

    /// Print results and logs as json.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Broadcast for machines on the local network and list them.
    Discover,

    /// Work out which protocol a machine speaks.
    Detect {
        /// Host name, IP address, or serial device path.
        target: Target,
    },

    /// Print the machine's telemetry.
    Status {
        /// Host name, IP address, or serial device path.
        target: Target,
    },

    /// Home all axes.
    Home {
        /// Host name, IP address, or serial device path.
        target: Target,
    },

    /// Pause the running job.
    Pause {
        /// Host name, IP address, or serial device path.
        target: Target,
    },

    /// Resume a paused job.
    Resume {
        /// Host name, IP address, or serial device path.
        target: Target,
    },

    /// Stop the current job.
    Stop {
        /// Host name, IP address, or serial device path.
        target: Target,
    },

    /// Store a file on the machine.
    Upload {
        /// Host name, IP address, or serial device path.
        target: Target,
        /// File to send.
        file: PathBuf,
    },

    /// Send a file to the machine, start it, and wait for it to finish.
    Print {
        /// Host name, IP address, or serial device path.
        target: Target,
        /// File to send.
        file: PathBuf,
    },

    /// Print every event from the machine until interrupted.
    Watch {
        /// Host name, IP address, or serial device path.
        target: Target,
    },
}

async fn handle_signals() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGINT handler");
            e
        })?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up SIGTERM handler");
            e
        })?;

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await.map_err(|e| {
            tracing::error!(error = format!("{:?}", e), "Failed to set up Ctrl+C handler");
            anyhow::Error::new(e)
        })?;

        tracing::info!("received Ctrl+C (SIGINT)");
    }

    Ok(())
}

/// Install the fmt layer, plus an OTLP exporter when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
fn init_tracing(json: bool) -> Result<Option<SdkTracerProvider>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let provider = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            let provider = SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(Resource::builder().with_service_name("machine-link").build())
                .build();
            opentelemetry::global::set_tracer_provider(provider.clone());
            Some(provider)
        }
        Err(_) => None,
    };
    let telemetry = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("machine-link")));

    let (plain, structured) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(structured)
        .with(telemetry)
        .init();

    Ok(provider)
}

fn print<T: Serialize>(json: bool, value: &T) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    Config::from_file(path)
}

/// Wait for the first telemetry snapshot, or give up after `timeout`.
async fn first_telemetry(mut events: broadcast::Receiver<MachineEvent>, timeout: Duration) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(MachineEvent::Telemetry { .. }) | Err(RecvError::Closed) => return,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    };
    if tokio::time::timeout(timeout, wait).await.is_err() {
        tracing::warn!("no telemetry yet, printing what we have");
    }
}

async fn watch(manager: &ConnectionManager, target: &Target, json: bool) -> Result<()> {
    let mut events = manager.subscribe_events();
    manager.open(target).await?;

    loop {
        match events.recv().await {
            Ok(event) => {
                print(json, &event)?;
                if let MachineEvent::ConnectionLost { reason } = event {
                    bail!("connection lost: {}", reason);
                }
            }
            Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "event output fell behind"),
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn run(cli: &Cli, manager: &ConnectionManager) -> Result<()> {
    match &cli.command {
        Commands::Discover => print(cli.json, &manager.discover().await?),
        Commands::Detect { target } => print(cli.json, &manager.detect(target).await?),
        Commands::Status { target } => {
            let events = manager.subscribe_events();
            manager.open(target).await?;
            first_telemetry(events, manager.config().session.liveness_timeout()).await;
            print(cli.json, &manager.snapshot().await?)
        }
        Commands::Home { target } => {
            manager.open(target).await?;
            manager.home().await
        }
        Commands::Pause { target } => {
            manager.open(target).await?;
            manager.pause().await
        }
        Commands::Resume { target } => {
            manager.open(target).await?;
            manager.resume().await
        }
        Commands::Stop { target } => {
            manager.open(target).await?;
            manager.stop().await
        }
        Commands::Upload { target, file } => {
            manager.open(target).await?;
            manager.upload_file(file).await
        }
        Commands::Print { target, file } => {
            manager.open(target).await?;
            match manager.run_job(file).await? {
                JobState::Completed => Ok(()),
                state => bail!("job ended {}", state),
            }
        }
        Commands::Watch { target } => watch(manager, target, cli.json).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let provider = init_tracing(cli.json)?;

    let manager = ConnectionManager::new(load_config(&cli.config)?);
    let result = tokio::select! {
        result = run(&cli, &manager) => result,
        result = handle_signals() => result,
    };

    tracing::debug!("triggering cleanup...");
    manager.close().await?;
    if let Some(provider) = provider {
        if let Err(err) = provider.shutdown() {
            tracing::warn!(error = format!("{:?}", err), "failed to flush traces");
        }
    }
    tracing::debug!("all clean, exiting!");

    result
}
