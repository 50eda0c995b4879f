//! Top-level lifecycle: plugins, outputs, devices.

use log::{error, info, warn};
use std::path::Path;
use tokio::sync::oneshot;
use tokio::time::{sleep, Duration};

use crate::bluetooth::Transport;
use crate::device::DeviceManager;
use crate::error::{DeviceError, ReaderError};
use crate::interval::Intervals;
use crate::models::DeviceDescriptor;
use crate::output::OutputBinding;
use crate::plugin::PluginRegistry;

/// Bounded linear backoff for connecting devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(500),
            step: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Pause after the zero-based `attempt` failed
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay + self.step * attempt
    }
}

pub struct Reader<T: Transport> {
    plugins: PluginRegistry,
    devices: DeviceManager<T>,
}

impl<T: Transport> Reader<T> {
    pub fn new(
        transport: T,
        descriptors: Vec<DeviceDescriptor>,
        plugins: PluginRegistry,
    ) -> Result<Self, ReaderError> {
        Self::with_intervals(transport, descriptors, plugins, Intervals::new())
    }

    pub fn with_intervals(
        transport: T,
        descriptors: Vec<DeviceDescriptor>,
        plugins: PluginRegistry,
        intervals: Intervals,
    ) -> Result<Self, ReaderError> {
        if descriptors.is_empty() {
            return Err(ReaderError::NoDevices);
        }
        Ok(Reader {
            plugins,
            devices: DeviceManager::with_intervals(transport, descriptors, intervals),
        })
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn devices(&self) -> &DeviceManager<T> {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut DeviceManager<T> {
        &mut self.devices
    }

    pub fn discover_plugins(&mut self, dir: &Path) -> Result<usize, ReaderError> {
        Ok(self.plugins.discover(dir)?)
    }

    /// Start one output per device with the plugin its descriptor names.
    ///
    /// On failure every output started so far is stopped again.
    pub fn create_outputs(&mut self) -> Result<(), ReaderError> {
        let mut started = Vec::new();

        for descriptor in self.devices.descriptors() {
            let started_output = match self.plugins.resolve(&descriptor.output_type) {
                Some(plugin) => OutputBinding::start(descriptor, plugin).map_err(ReaderError::from),
                None => Err(ReaderError::UnknownOutputType {
                    device: descriptor.id,
                    output_type: descriptor.output_type.clone(),
                }),
            };

            match started_output {
                Ok(binding) => started.push((descriptor.id, binding.shared())),
                Err(e) => {
                    error!("Device {}: {}", descriptor.id, e);
                    for (_, output) in started {
                        if let Err(e) = output.lock().stop() {
                            warn!("{}", e);
                        }
                    }
                    return Err(e);
                }
            }
        }

        for (device, output) in started {
            self.devices.bind_output(device, output)?;
        }
        Ok(())
    }

    /// Stop and detach every output. Returns how many failed to stop cleanly.
    pub fn destroy_outputs(&mut self) -> usize {
        let mut failed = 0;
        for (device, output) in self.devices.take_outputs() {
            let mut output = output.lock();
            if !output.is_started() {
                continue;
            }
            if let Err(e) = output.stop() {
                error!("Device {}: {}", device, e);
                failed += 1;
            }
        }
        failed
    }

    /// Connect all devices, retrying the ones that failed.
    pub async fn connect_with_retry(&mut self, policy: &RetryPolicy) -> Result<(), ReaderError> {
        for attempt in 0..policy.attempts {
            match self.devices.connect_all().await {
                Ok(()) => {
                    info!("All {} device(s) connected", self.devices.len());
                    return Ok(());
                }
                Err(e) => warn!(
                    "Connection attempt {}/{} failed: {}",
                    attempt + 1,
                    policy.attempts,
                    e
                ),
            }

            if attempt + 1 < policy.attempts {
                sleep(policy.delay(attempt)).await;
            }
        }
        Err(DeviceError::RetriesExhausted(policy.attempts).into())
    }

    pub async fn register(&mut self) -> Result<(), ReaderError> {
        Ok(self.devices.register_all().await?)
    }

    /// Undo everything in reverse order. Each step runs even if an earlier one failed.
    pub async fn shutdown(&mut self) {
        info!("Shutting down");
        if let Err(e) = self.devices.unregister_all().await {
            warn!("{}", e);
        }
        if let Err(e) = self.devices.disconnect_all().await {
            warn!("{}", e);
        }
        let failed = self.destroy_outputs();
        if failed > 0 {
            warn!("{} output(s) did not stop cleanly", failed);
        }
        self.plugins.unload_all();
    }
}

/// Resolve once a shutdown has been requested through `shutdown`.
///
/// A sender dropped without sending means the signal listener died. That is
/// logged once and the wait then never resolves, so readings keep flowing.
pub async fn shutdown_requested(shutdown: &mut Option<oneshot::Receiver<()>>) {
    let outcome = match shutdown.as_mut() {
        Some(rx) => rx.await,
        None => return std::future::pending().await,
    };
    *shutdown = None;
    if outcome.is_err() {
        error!("Shutdown listener stopped; Ctrl+C will no longer stop the reader");
        std::future::pending::<()>().await;
    }
}
