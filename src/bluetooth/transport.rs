/// GATT notification transport: the trait the device manager drives and its BlueZ implementation
use async_trait::async_trait;
use bluer::{gatt::remote::Characteristic, Adapter, Address, Device, Session, Uuid};
use futures_util::StreamExt;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::bluetooth::payload::SERVICE_UUID;
use crate::error::TransportError;
use crate::utils::hex_dump;

const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Called with `(characteristic, payload)` for every notification
pub type NotificationHandler = Arc<dyn Fn(Uuid, &[u8]) + Send + Sync>;

/// Connection-oriented access to GATT notifications
#[async_trait]
pub trait Transport: Send + Sync {
    type Connection: Send + Sync;

    async fn connect(&self, address: &str) -> Result<Self::Connection, TransportError>;

    async fn disconnect(&self, conn: &Self::Connection) -> Result<(), TransportError>;

    /// Start delivering notifications of `uuid` to `handler`.
    async fn subscribe(
        &self,
        conn: &Self::Connection,
        uuid: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(&self, conn: &Self::Connection, uuid: Uuid) -> Result<(), TransportError>;
}

/// BlueZ transport over D-Bus
pub struct BluerTransport {
    _session: Session,
    adapter: Adapter,
}

impl BluerTransport {
    /// Open a session on the default adapter and power it on.
    pub async fn new() -> Result<Self, TransportError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!("Using Bluetooth adapter {}", adapter.name());
        Ok(BluerTransport {
            _session: session,
            adapter,
        })
    }
}

/// A connected device and its running notification tasks
pub struct BluerConnection {
    address: Address,
    device: Device,
    notifications: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl BluerConnection {
    pub fn address(&self) -> Address {
        self.address
    }

    fn abort_notifications(&self) {
        for (uuid, task) in self.notifications.lock().drain() {
            debug!("{}: stopping notifications of {}", self.address, uuid);
            task.abort();
        }
    }

    async fn wait_for_services(&self) -> Result<(), TransportError> {
        let deadline = Instant::now() + SERVICES_RESOLVE_TIMEOUT;
        while !self.device.is_services_resolved().await? {
            if Instant::now() >= deadline {
                return Err(TransportError::ServicesUnresolved(self.address.to_string()));
            }
            sleep(SERVICES_POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        for service in self.device.services().await? {
            if service.uuid().await? != SERVICE_UUID {
                continue;
            }
            for characteristic in service.characteristics().await? {
                if characteristic.uuid().await? == uuid {
                    return Ok(characteristic);
                }
            }
        }
        Err(TransportError::CharacteristicNotFound(uuid))
    }
}

/// Await `setup` on a link that is already up, running `rollback` if it fails.
///
/// The setup error is returned even when the rollback itself fails.
async fn setup_or_rollback<S, R, F>(address: &str, setup: S, rollback: R) -> Result<(), TransportError>
where
    S: Future<Output = Result<(), TransportError>>,
    R: FnOnce() -> F,
    F: Future<Output = Result<(), TransportError>>,
{
    let err = match setup.await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    warn!("{}: {}; disconnecting", address, err);
    if let Err(e) = rollback().await {
        error!("{}: disconnect after failed setup failed: {}", address, e);
    }
    Err(err)
}

impl Drop for BluerConnection {
    fn drop(&mut self) {
        self.abort_notifications();
    }
}

#[async_trait]
impl Transport for BluerTransport {
    type Connection = BluerConnection;

    async fn connect(&self, address: &str) -> Result<BluerConnection, TransportError> {
        let parsed: Address = address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
        let device = self.adapter.device(parsed)?;

        if device.is_connected().await? {
            debug!("{} already connected", parsed);
        } else {
            info!("Connecting to {}", parsed);
            device.connect().await?;
        }

        let conn = BluerConnection {
            address: parsed,
            device,
            notifications: Mutex::new(HashMap::new()),
        };
        let device = &conn.device;
        setup_or_rollback(address, conn.wait_for_services(), move || async move {
            device.disconnect().await.map_err(TransportError::from)
        })
        .await?;
        info!("Connected to {}", parsed);
        Ok(conn)
    }

    async fn disconnect(&self, conn: &BluerConnection) -> Result<(), TransportError> {
        conn.abort_notifications();
        info!("Disconnecting from {}", conn.address);
        conn.device.disconnect().await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        conn: &BluerConnection,
        uuid: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        let characteristic = conn.characteristic(uuid).await?;
        let stream = characteristic.notify().await?;
        let address = conn.address;

        let task = tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(value) = stream.next().await {
                trace!("{} {}: [{}]", address, uuid, hex_dump(&value));
                handler(uuid, &value);
            }
            debug!("{}: notification stream of {} ended", address, uuid);
        });

        if let Some(previous) = conn.notifications.lock().insert(uuid, task) {
            warn!("{}: replacing existing subscription to {}", address, uuid);
            previous.abort();
        }
        debug!("{}: subscribed to {}", address, uuid);
        Ok(())
    }

    async fn unsubscribe(&self, conn: &BluerConnection, uuid: Uuid) -> Result<(), TransportError> {
        match conn.notifications.lock().remove(&uuid) {
            Some(task) => {
                // dropping the stream tells BlueZ to stop notifying
                task.abort();
                debug!("{}: unsubscribed from {}", conn.address, uuid);
                Ok(())
            }
            None => Err(TransportError::NotSubscribed(uuid)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::payload::VOC_UUID;
    use std::cell::Cell;

    fn unresolved() -> TransportError {
        TransportError::ServicesUnresolved("F7:35:49:55:35:00".to_string())
    }

    #[tokio::test]
    async fn successful_setup_keeps_the_link() {
        let rollbacks = Cell::new(0);
        let counter = &rollbacks;
        let result = setup_or_rollback("F7:35:49:55:35:00", async { Ok(()) }, move || async move {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(rollbacks.get(), 0);
    }

    #[tokio::test]
    async fn unresolved_services_disconnect_the_link() {
        let rollbacks = Cell::new(0);
        let counter = &rollbacks;
        let result = setup_or_rollback(
            "F7:35:49:55:35:00",
            async { Err(unresolved()) },
            move || async move {
                counter.set(counter.get() + 1);
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(TransportError::ServicesUnresolved(_))));
        assert_eq!(rollbacks.get(), 1);
    }

    #[tokio::test]
    async fn failed_disconnect_keeps_the_setup_error() {
        let result = setup_or_rollback(
            "F7:35:49:55:35:00",
            async { Err(unresolved()) },
            || async { Err(TransportError::NotSubscribed(VOC_UUID)) },
        )
        .await;

        assert!(matches!(result, Err(TransportError::ServicesUnresolved(_))));
    }
}
