use clap::Parser;
use log::{error, info};
use std::time::Duration;

use atmotube::bluetooth::scanner::{search, DEFAULT_DEVICE_NAME, DEFAULT_SCAN_DURATION};

/// Scan for Atmotube devices and print their addresses
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Advertised name to look for
    #[arg(short, long, default_value = DEFAULT_DEVICE_NAME)]
    name: String,

    /// Scan duration in seconds
    #[arg(short, long, default_value_t = DEFAULT_SCAN_DURATION.as_secs())]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    let args = Args::parse();
    info!("Scanning {} s for devices named {:?}", args.timeout, args.name);

    let found = match search(&args.name, Duration::from_secs(args.timeout)).await {
        Ok(found) => found,
        Err(e) => {
            error!("Scan failed: {}", e);
            return Err(e.into());
        }
    };

    if found.is_empty() {
        info!("No devices found");
    }
    for device in found {
        match device.rssi {
            Some(rssi) => println!("{}\t{}\t{} dBm", device.address, device.name, rssi),
            None => println!("{}\t{}", device.address, device.name),
        }
    }
    Ok(())
}
