/// Bluetooth Low Energy discovery of Atmotube devices by advertised name
use futures_util::StreamExt;
use log::{debug, error, warn};
use tokio::time::{sleep, Duration};

use crate::error::TransportError;

/// Name an Atmotube advertises out of the box
pub const DEFAULT_DEVICE_NAME: &str = "ATMOTUBE";
/// How long to scan when no duration is given
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

/// A device whose advertised name matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub address: String,
    pub name: String,
    pub rssi: Option<i16>,
}

/// Scan for devices advertising `name`
///
/// Discovery runs for `duration` on the default adapter, after which every
/// device BlueZ knows about is checked. Results are sorted by address and
/// contain each device once.
pub async fn search(name: &str, duration: Duration) -> Result<Vec<FoundDevice>, TransportError> {
    let session = match bluer::Session::new().await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to create Bluetooth session: {}", e);
            return Err(e.into());
        }
    };

    let adapter = match session.default_adapter().await {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("Failed to get default Bluetooth adapter: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = adapter.set_powered(true).await {
        error!("Failed to power on adapter: {}", e);
        return Err(e.into());
    }

    // Atmotubes only advertise over LE
    let filter = bluer::DiscoveryFilter {
        transport: bluer::DiscoveryTransport::Le,
        duplicate_data: false,
        ..Default::default()
    };
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("Failed to set discovery filter: {}", e);
    }

    let discovery_handle = match adapter.discover_devices().await {
        Ok(discovery_stream) => tokio::spawn(async move {
            let mut stream = discovery_stream;
            while let Some(event) = stream.next().await {
                debug!("Discovery event: {:?}", event);
            }
        }),
        Err(e) => {
            error!("Failed to start device discovery: {}", e);
            return Err(e.into());
        }
    };

    sleep(duration).await;
    discovery_handle.abort();

    let mut found = Vec::new();
    for addr in adapter.device_addresses().await? {
        let device = match adapter.device(addr) {
            Ok(device) => device,
            Err(_) => continue,
        };

        match device.name().await {
            Ok(Some(advertised)) if advertised == name => {
                let rssi = device.rssi().await.ok().flatten();
                debug!("Found {} at {} (rssi {:?})", advertised, addr, rssi);
                found.push(FoundDevice {
                    address: addr.to_string(),
                    name: advertised,
                    rssi,
                });
            }
            Ok(_) => {}
            Err(e) => debug!("Failed to read name of {}: {}", addr, e),
        }
    }

    Ok(dedup_by_address(found))
}

fn dedup_by_address(mut found: Vec<FoundDevice>) -> Vec<FoundDevice> {
    found.sort_by(|a, b| a.address.cmp(&b.address));
    found.dedup_by(|a, b| a.address == b.address);
    found
}
