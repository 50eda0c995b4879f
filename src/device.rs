//! Device connections, notification registration and routing.
//!
//! Each configured device moves through
//! `Disconnected -> Connecting -> Connected -> Registered -> Unregistering`.
//! Registration creates one aggregation window per numeric reading kind and
//! subscribes all four characteristics; notifications are then routed into
//! that device's windows only.

use bluer::Uuid;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::bluetooth::payload::{self, characteristic_uuid};
use crate::bluetooth::{NotificationHandler, Transport};
use crate::error::{DeviceError, IntervalError};
use crate::interval::{IntervalKey, Intervals, Recorded, Value};
use crate::models::{ConnectionState, DeviceDescriptor, DeviceId, Reading, ReadingKind, Status};
use crate::output::{flush_callback, SharedOutput};

/// Engine shared with notification tasks
pub type SharedIntervals = Arc<Mutex<Intervals>>;

/// Receives status readings, which are never aggregated
pub type StatusHandler = Arc<dyn Fn(DeviceId, &Status) + Send + Sync>;

/// Window key of an aggregated reading kind, `None` for status
pub fn window_key(device: DeviceId, kind: ReadingKind) -> Option<IntervalKey> {
    kind.format()
        .map(|format| IntervalKey::new(device, kind.label(), format))
}

fn log_status(device: DeviceId, status: &Status) {
    info!("Device {} status: {}", device, status);
}

/// Decodes notifications and records them under the owning device's windows
#[derive(Clone)]
pub struct NotificationRouter {
    intervals: SharedIntervals,
    status_handler: StatusHandler,
}

impl NotificationRouter {
    /// Returns what the engine did with the sample, or `None` if it was dropped.
    pub fn route(&self, device: DeviceId, uuid: Uuid, data: &[u8]) -> Option<Recorded> {
        let Some(kind) = payload::reading_kind(&uuid) else {
            warn!("Device {}: notification from unknown characteristic {}", device, uuid);
            return None;
        };

        let value = match payload::decode(kind, data) {
            Ok(Reading::Status(status)) => {
                (self.status_handler)(device, &status);
                return None;
            }
            Ok(Reading::Voc(v)) => Value::Float(v),
            Ok(Reading::Humidity(v)) | Ok(Reading::Temperature(v)) => Value::Ulong(u64::from(v)),
            Err(e) => {
                warn!("Device {}: dropping notification: {}", device, e);
                return None;
            }
        };

        let key = window_key(device, kind)?;
        match self.intervals.lock().record(&key, value) {
            Ok(recorded) => {
                debug!("Device {}: {} {} {:?}", device, kind, value, recorded);
                Some(recorded)
            }
            Err(IntervalError::NotFound(_)) => {
                debug!("Device {}: no {} window, sample dropped", device, kind);
                None
            }
            Err(e) => {
                warn!("Device {}: {}", device, e);
                None
            }
        }
    }
}

struct DeviceSlot<C> {
    descriptor: DeviceDescriptor,
    state: ConnectionState,
    connection: Option<C>,
    output: Option<SharedOutput>,
    subscribed: Vec<Uuid>,
}

/// Owns the configured devices and drives them through the transport
pub struct DeviceManager<T: Transport> {
    transport: T,
    devices: Vec<DeviceSlot<T::Connection>>,
    router: NotificationRouter,
}

impl<T: Transport> DeviceManager<T> {
    pub fn new(transport: T, descriptors: Vec<DeviceDescriptor>) -> Self {
        Self::with_intervals(transport, descriptors, Intervals::new())
    }

    pub fn with_intervals(
        transport: T,
        descriptors: Vec<DeviceDescriptor>,
        intervals: Intervals,
    ) -> Self {
        let devices = descriptors
            .into_iter()
            .map(|descriptor| DeviceSlot {
                descriptor,
                state: ConnectionState::Disconnected,
                connection: None,
                output: None,
                subscribed: Vec::new(),
            })
            .collect();

        DeviceManager {
            transport,
            devices,
            router: NotificationRouter {
                intervals: Arc::new(Mutex::new(intervals)),
                status_handler: Arc::new(log_status),
            },
        }
    }

    /// Replace the default status handler, which logs at info level.
    pub fn set_status_handler(&mut self, handler: StatusHandler) {
        self.router.status_handler = handler;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn intervals(&self) -> &SharedIntervals {
        &self.router.intervals
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter().map(|slot| &slot.descriptor)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn state(&self, device: DeviceId) -> Option<ConnectionState> {
        self.slot(device).map(|slot| slot.state)
    }

    pub fn is_connected(&self, device: DeviceId) -> bool {
        self.state(device).is_some_and(ConnectionState::is_connected)
    }

    /// Attach the output that registered windows of `device` flush into.
    pub fn bind_output(&mut self, device: DeviceId, output: SharedOutput) -> Result<(), DeviceError> {
        let slot = self
            .devices
            .iter_mut()
            .find(|slot| slot.descriptor.id == device)
            .ok_or(DeviceError::UnknownDevice(device))?;
        if slot.output.replace(output).is_some() {
            warn!("Device {}: replacing bound output", device);
        }
        Ok(())
    }

    /// Detach every bound output.
    pub fn take_outputs(&mut self) -> Vec<(DeviceId, SharedOutput)> {
        self.devices
            .iter_mut()
            .filter_map(|slot| slot.output.take().map(|o| (slot.descriptor.id, o)))
            .collect()
    }

    /// Handle one notification as if the transport had delivered it.
    pub fn on_notification(&self, device: DeviceId, uuid: Uuid, data: &[u8]) -> Option<Recorded> {
        self.router.route(device, uuid, data)
    }

    /// Connect every device that is not connected yet.
    pub async fn connect_all(&mut self) -> Result<(), DeviceError> {
        let total = self.devices.len();
        let mut failed = 0;

        for slot in &mut self.devices {
            if slot.state.is_connected() {
                debug!("Device {} already connected", slot.descriptor.id);
                continue;
            }

            slot.state = ConnectionState::Connecting;
            match self.transport.connect(&slot.descriptor.address).await {
                Ok(conn) => {
                    slot.connection = Some(conn);
                    slot.state = ConnectionState::Connected;
                    info!(
                        "Device {} ({}) connected",
                        slot.descriptor.id, slot.descriptor.name
                    );
                }
                Err(e) => {
                    slot.state = ConnectionState::Disconnected;
                    error!(
                        "Device {} ({}): connect failed: {}",
                        slot.descriptor.id, slot.descriptor.address, e
                    );
                    failed += 1;
                }
            }
        }

        partial("connect", failed, total)
    }

    /// Disconnect every connected device, unregistering it first if needed.
    pub async fn disconnect_all(&mut self) -> Result<(), DeviceError> {
        let total = self.devices.len();
        let mut failed = 0;

        for slot in &mut self.devices {
            if !slot.state.is_connected() {
                continue;
            }
            if slot.state == ConnectionState::Registered {
                unregister_device(&self.transport, &self.router.intervals, slot).await;
            }

            if let Some(conn) = slot.connection.take() {
                if let Err(e) = self.transport.disconnect(&conn).await {
                    error!("Device {}: disconnect failed: {}", slot.descriptor.id, e);
                    failed += 1;
                }
            }
            slot.state = ConnectionState::Disconnected;
            info!("Device {} disconnected", slot.descriptor.id);
        }

        partial("disconnect", failed, total)
    }

    /// Create windows and subscribe notifications for every connected device.
    ///
    /// A device that fails is torn down and disconnected without affecting
    /// the others.
    pub async fn register_all(&mut self) -> Result<(), DeviceError> {
        let total = self.devices.len();
        let mut failed = 0;

        for slot in &mut self.devices {
            if slot.state != ConnectionState::Connected {
                continue;
            }

            if let Err(e) = register_device(&self.transport, &self.router, slot).await {
                error!("Device {}: registration failed: {}", slot.descriptor.id, e);
                failed += 1;

                unregister_device(&self.transport, &self.router.intervals, slot).await;
                if let Some(conn) = slot.connection.take() {
                    if let Err(e) = self.transport.disconnect(&conn).await {
                        warn!("Device {}: disconnect failed: {}", slot.descriptor.id, e);
                    }
                }
                slot.state = ConnectionState::Disconnected;
            }
        }

        partial("register", failed, total)
    }

    /// Remove every device's windows and unsubscribe connected devices.
    pub async fn unregister_all(&mut self) -> Result<(), DeviceError> {
        let total = self.devices.len();
        let mut failed = 0;

        for slot in &mut self.devices {
            if unregister_device(&self.transport, &self.router.intervals, slot).await > 0 {
                failed += 1;
            }
        }

        partial("unregister", failed, total)
    }

    fn slot(&self, device: DeviceId) -> Option<&DeviceSlot<T::Connection>> {
        self.devices.iter().find(|slot| slot.descriptor.id == device)
    }
}

async fn register_device<T: Transport>(
    transport: &T,
    router: &NotificationRouter,
    slot: &mut DeviceSlot<T::Connection>,
) -> Result<(), DeviceError> {
    let id = slot.descriptor.id;
    let conn = slot.connection.as_ref().ok_or(DeviceError::NotConnected(id))?;

    {
        let mut intervals = router.intervals.lock();
        for kind in ReadingKind::AGGREGATED {
            let Some(key) = window_key(id, kind) else {
                continue;
            };
            intervals.add(key.clone())?;
            match &slot.output {
                Some(output) => {
                    intervals.bind_callback(&key, flush_callback(Arc::clone(output), kind))?
                }
                None => warn!("Device {}: no output bound, {} averages are discarded", id, kind),
            }
            intervals.start(&key, slot.descriptor.resolution_ms)?;
        }
    }

    for kind in ReadingKind::ALL {
        let uuid = characteristic_uuid(kind);
        let router = router.clone();
        let handler: NotificationHandler = Arc::new(move |uuid, data| {
            router.route(id, uuid, data);
        });
        transport.subscribe(conn, uuid, handler).await?;
        slot.subscribed.push(uuid);
    }

    slot.state = ConnectionState::Registered;
    info!(
        "Device {} registered ({} ms resolution)",
        id, slot.descriptor.resolution_ms
    );
    Ok(())
}

/// Tear down one device's windows and subscriptions, returning how many
/// unsubscribe calls failed.
async fn unregister_device<T: Transport>(
    transport: &T,
    intervals: &SharedIntervals,
    slot: &mut DeviceSlot<T::Connection>,
) -> usize {
    let id = slot.descriptor.id;
    let registered = slot.state == ConnectionState::Registered;
    if registered {
        slot.state = ConnectionState::Unregistering;
    }

    {
        let mut intervals = intervals.lock();
        for kind in ReadingKind::AGGREGATED {
            let Some(key) = window_key(id, kind) else {
                continue;
            };
            if !intervals.contains(&key) {
                continue;
            }
            if let Err(e) = intervals.stop(&key) {
                warn!("Device {}: {}", id, e);
            }
            if let Err(e) = intervals.remove(&key) {
                warn!("Device {}: {}", id, e);
            }
        }
    }

    let mut failed = 0;
    let subscribed = std::mem::take(&mut slot.subscribed);
    if let Some(conn) = &slot.connection {
        for uuid in subscribed {
            if let Err(e) = transport.unsubscribe(conn, uuid).await {
                warn!("Device {}: unsubscribe from {} failed: {}", id, uuid, e);
                failed += 1;
            }
        }
    }

    if registered {
        slot.state = ConnectionState::Connected;
        info!("Device {} unregistered", id);
    }
    failed
}

fn partial(operation: &'static str, failed: usize, total: usize) -> Result<(), DeviceError> {
    if failed == 0 {
        Ok(())
    } else {
        Err(DeviceError::Partial {
            operation,
            failed,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::MockTransport;
    use crate::bluetooth::payload::{HUMIDITY_UUID, STATUS_UUID, TEMPERATURE_UUID, VOC_UUID};
    use crate::interval::{ManualClock, WindowState};
    use crate::models::SamplingMode;

    fn descriptor(id: DeviceId) -> DeviceDescriptor {
        DeviceDescriptor {
            id,
            name: format!("device{}", id),
            address: format!("00:00:00:00:00:0{}", id),
            description: String::new(),
            resolution_ms: 500,
            output_type: "file".to_string(),
            output_target: None,
        }
    }

    fn manager(count: u32) -> (MockTransport, Arc<ManualClock>, DeviceManager<MockTransport>) {
        let transport = MockTransport::new();
        let clock = Arc::new(ManualClock::new(0));
        let manager = DeviceManager::with_intervals(
            transport.clone(),
            (0..count).map(descriptor).collect(),
            Intervals::with_clock(clock.clone()),
        );
        (transport, clock, manager)
    }

    #[tokio::test]
    async fn connect_all_skips_connected_devices() {
        let (transport, _clock, mut manager) = manager(2);
        transport.fail_connect("00:00:00:00:00:01", 1);

        assert!(matches!(
            manager.connect_all().await,
            Err(DeviceError::Partial { failed: 1, total: 2, .. })
        ));
        assert_eq!(manager.state(0), Some(ConnectionState::Connected));
        assert_eq!(manager.state(1), Some(ConnectionState::Disconnected));

        manager.connect_all().await.unwrap();
        assert!(manager.is_connected(1));
        assert_eq!(transport.connect_attempts("00:00:00:00:00:00"), 1);
        assert_eq!(transport.connect_attempts("00:00:00:00:00:01"), 2);
    }

    #[tokio::test]
    async fn register_creates_running_windows_and_subscriptions() {
        let (transport, _clock, mut manager) = manager(1);
        manager.connect_all().await.unwrap();
        manager.register_all().await.unwrap();

        assert_eq!(manager.state(0), Some(ConnectionState::Registered));
        assert_eq!(transport.subscription_count("00:00:00:00:00:00"), 4);
        let intervals = manager.intervals().lock();
        for kind in ReadingKind::AGGREGATED {
            let key = window_key(0, kind).unwrap();
            assert_eq!(intervals.state(&key), Some(WindowState::Running));
        }
        assert_eq!(intervals.len(), 3);
    }

    #[tokio::test]
    async fn disconnected_devices_are_not_registered() {
        let (_transport, _clock, mut manager) = manager(1);
        manager.register_all().await.unwrap();
        assert_eq!(manager.state(0), Some(ConnectionState::Disconnected));
        assert!(manager.intervals().lock().is_empty());
    }

    #[tokio::test]
    async fn notifications_route_to_own_device() {
        let (transport, clock, mut manager) = manager(2);
        manager.connect_all().await.unwrap();
        manager.register_all().await.unwrap();

        clock.advance(100);
        assert!(transport.notify("00:00:00:00:00:00", TEMPERATURE_UUID, &[20]));
        assert!(transport.notify("00:00:00:00:00:01", TEMPERATURE_UUID, &[30]));

        let dump = manager.intervals().lock().dump();
        let average = |device: DeviceId| {
            dump.iter()
                .find(|w| w.key.device == device && w.key.label == "temperature")
                .map(|w| w.average)
        };
        assert_eq!(average(0), Some(Value::Ulong(20)));
        assert_eq!(average(1), Some(Value::Ulong(30)));
    }

    #[tokio::test]
    async fn bad_notifications_are_dropped() {
        let (_transport, _clock, mut manager) = manager(1);
        manager.connect_all().await.unwrap();
        manager.register_all().await.unwrap();

        assert_eq!(manager.on_notification(0, VOC_UUID, &[0x01]), None);
        assert_eq!(manager.on_notification(0, Uuid::nil(), &[0x01, 0x02]), None);
        assert_eq!(manager.on_notification(9, HUMIDITY_UUID, &[40]), None);
        assert_eq!(
            manager.on_notification(0, HUMIDITY_UUID, &[40]),
            Some(Recorded::Accumulated)
        );
        let voc = window_key(0, ReadingKind::Voc).unwrap();
        let dump = manager.intervals().lock().dump();
        assert_eq!(dump.iter().find(|w| w.key == voc).unwrap().samples, 0);
    }

    #[tokio::test]
    async fn status_goes_to_handler_without_windows() {
        let (transport, _clock, mut manager) = manager(1);
        let seen: Arc<Mutex<Vec<(DeviceId, Status)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        manager.set_status_handler(Arc::new(move |device, status| {
            sink.lock().push((device, *status));
        }));
        manager.connect_all().await.unwrap();
        manager.register_all().await.unwrap();

        assert!(transport.notify("00:00:00:00:00:00", STATUS_UUID, &[0x41]));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 0);
        assert_eq!(seen[0].1.mode, SamplingMode::Fast);
        assert_eq!(seen[0].1.battery_percent, 25);
    }

    #[tokio::test]
    async fn unregister_keeps_connection_and_drops_late_samples() {
        let (transport, _clock, mut manager) = manager(1);
        manager.connect_all().await.unwrap();
        manager.register_all().await.unwrap();
        manager.unregister_all().await.unwrap();

        assert_eq!(manager.state(0), Some(ConnectionState::Connected));
        assert_eq!(transport.subscription_count("00:00:00:00:00:00"), 0);
        assert!(manager.intervals().lock().is_empty());
        assert_eq!(manager.on_notification(0, TEMPERATURE_UUID, &[20]), None);

        // registering again starts from fresh windows
        manager.register_all().await.unwrap();
        assert_eq!(manager.state(0), Some(ConnectionState::Registered));
    }

    #[tokio::test]
    async fn disconnect_all_unregisters_first() {
        let (transport, _clock, mut manager) = manager(2);
        manager.connect_all().await.unwrap();
        manager.register_all().await.unwrap();
        manager.disconnect_all().await.unwrap();

        for id in 0..2 {
            assert_eq!(manager.state(id), Some(ConnectionState::Disconnected));
        }
        assert!(!transport.is_connected("00:00:00:00:00:00"));
        assert!(manager.intervals().lock().is_empty());

        // nothing left to disconnect
        manager.disconnect_all().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_device_has_no_state() {
        let (_transport, _clock, mut manager) = manager(1);
        assert!(manager.take_outputs().is_empty());
        assert_eq!(manager.descriptors().count(), 1);
        assert!(!manager.is_connected(5));
        assert_eq!(manager.state(5), None);
    }
}
