use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use time::OffsetDateTime;
use tokio::sync::oneshot;

use atmotube::bluetooth::BluerTransport;
use atmotube::config::Config;
use atmotube::plugin::PluginRegistry;
use atmotube::reader::{shutdown_requested, Reader, RetryPolicy};
use atmotube::utils::format_datetime;

/// Read Atmotube sensors and forward averaged readings to output plugins
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Config file (default: $ATMOTUBE_CONFIG or ~/.atmotube/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

async fn run(
    reader: &mut Reader<BluerTransport>,
    shutdown: &mut Option<oneshot::Receiver<()>>,
) -> Result<(), Box<dyn std::error::Error>> {
    reader.create_outputs()?;

    let policy = RetryPolicy::default();
    let connected = tokio::select! {
        result = reader.connect_with_retry(&policy) => Some(result),
        _ = shutdown_requested(shutdown) => None,
    };
    match connected {
        Some(result) => result?,
        None => {
            info!("Interrupted while connecting");
            return Ok(());
        }
    }

    if let Err(e) = reader.register().await {
        // devices that failed were disconnected; the rest keep running
        warn!("{}", e);
    }

    info!(
        "Collecting readings since {}",
        format_datetime(&OffsetDateTime::now_utc())
    );
    shutdown_requested(shutdown).await;
    info!("Program terminated by user. Exiting gracefully.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let mut plugins = PluginRegistry::new();
    if let Err(e) = plugins.discover(&config.plugin_path) {
        error!("Failed to load output plugins: {}", e);
        return Err(e.into());
    }

    let transport = BluerTransport::new().await?;
    let mut reader = Reader::new(transport, config.devices, plugins)?;

    // Handle Ctrl+C gracefully
    let (tx, rx) = oneshot::channel();
    let mut shutdown = Some(rx);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    let result = run(&mut reader, &mut shutdown).await;
    if let Err(e) = &result {
        error!("Fatal error: {}", e);
    }
    reader.shutdown().await;
    result
}
