//! In-memory transport for tests.
//!
//! Notifications are injected with [`MockTransport::notify`] and delivered
//! synchronously on the caller's thread.

use async_trait::async_trait;
use bluer::Uuid;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::bluetooth::{NotificationHandler, Transport};
use crate::error::TransportError;

#[derive(Default)]
struct MockState {
    connected: HashSet<String>,
    connect_attempts: HashMap<String, u32>,
    connect_failures: HashMap<String, u32>,
    subscribe_failures: HashSet<(String, Uuid)>,
    subscriptions: HashMap<(String, Uuid), NotificationHandler>,
}

/// Cloneable handle; clones share the same simulated devices.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Clone)]
pub struct MockConnection {
    address: String,
}

impl MockConnection {
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` connection attempts to `address` fail.
    pub fn fail_connect(&self, address: &str, times: u32) {
        self.state
            .lock()
            .connect_failures
            .insert(address.to_string(), times);
    }

    /// Make every subscription to `uuid` on `address` fail.
    pub fn fail_subscribe(&self, address: &str, uuid: Uuid) {
        self.state
            .lock()
            .subscribe_failures
            .insert((address.to_string(), uuid));
    }

    /// Deliver a notification; returns `false` if nobody is subscribed.
    pub fn notify(&self, address: &str, uuid: Uuid, payload: &[u8]) -> bool {
        let handler = self
            .state
            .lock()
            .subscriptions
            .get(&(address.to_string(), uuid))
            .cloned();
        match handler {
            Some(handler) => {
                handler(uuid, payload);
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.state.lock().connected.contains(address)
    }

    pub fn is_subscribed(&self, address: &str, uuid: Uuid) -> bool {
        self.state
            .lock()
            .subscriptions
            .contains_key(&(address.to_string(), uuid))
    }

    pub fn subscription_count(&self, address: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .keys()
            .filter(|(a, _)| a == address)
            .count()
    }

    pub fn connect_attempts(&self, address: &str) -> u32 {
        self.state
            .lock()
            .connect_attempts
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(&self, address: &str) -> Result<MockConnection, TransportError> {
        let mut state = self.state.lock();
        *state.connect_attempts.entry(address.to_string()).or_default() += 1;

        if let Some(remaining) = state.connect_failures.get_mut(address) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Other(format!("{} unreachable", address)));
            }
        }
        state.connected.insert(address.to_string());
        Ok(MockConnection {
            address: address.to_string(),
        })
    }

    async fn disconnect(&self, conn: &MockConnection) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.subscriptions.retain(|(a, _), _| a != &conn.address);
        state.connected.remove(&conn.address);
        Ok(())
    }

    async fn subscribe(
        &self,
        conn: &MockConnection,
        uuid: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let key = (conn.address.clone(), uuid);
        if state.subscribe_failures.contains(&key) {
            return Err(TransportError::CharacteristicNotFound(uuid));
        }
        state.subscriptions.insert(key, handler);
        Ok(())
    }

    async fn unsubscribe(&self, conn: &MockConnection, uuid: Uuid) -> Result<(), TransportError> {
        match self
            .state
            .lock()
            .subscriptions
            .remove(&(conn.address.clone(), uuid))
        {
            Some(_) => Ok(()),
            None => Err(TransportError::NotSubscribed(uuid)),
        }
    }
}
