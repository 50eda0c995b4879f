//! Per-device output bindings: a started plugin instance and its state handle.

use atmotube_plugin::{RawOutput, RET_OK};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::ffi::{c_void, CString};
use std::ptr;
use std::sync::Arc;

use crate::error::OutputError;
use crate::interval::{FlushCallback, Value};
use crate::models::{DeviceDescriptor, DeviceId, ReadingKind};
use crate::plugin::PluginRecord;

/// Opaque plugin state, only ever handed back to the plugin that created it
struct SinkState(*mut c_void);

// SAFETY: the host never dereferences the handle and every use is
// serialised by the binding's mutex
unsafe impl Send for SinkState {}

/// Output binding shared between the device manager and flush callbacks
pub type SharedOutput = Arc<Mutex<OutputBinding>>;

pub struct OutputBinding {
    device: DeviceId,
    plugin: Arc<PluginRecord>,
    state: Option<SinkState>,
}

impl OutputBinding {
    /// Start `plugin` for a device.
    pub fn start(
        descriptor: &DeviceDescriptor,
        plugin: Arc<PluginRecord>,
    ) -> Result<Self, OutputError> {
        let filename = descriptor
            .output_target
            .as_deref()
            .map(CString::new)
            .transpose()?;
        let name = CString::new(descriptor.name.as_str())?;
        let address = CString::new(descriptor.address.as_str())?;

        let raw = RawOutput {
            filename: filename.as_ref().map_or(ptr::null(), |f| f.as_ptr()),
            device_name: name.as_ptr(),
            device_address: address.as_ptr(),
        };
        let mut state = ptr::null_mut();

        // SAFETY: `raw` and its strings outlive the call
        let status = unsafe { (plugin.table().start)(&raw, &mut state) };
        if status != RET_OK {
            return Err(OutputError::StartFailed {
                plugin_type: plugin.type_id().to_string(),
                device: descriptor.id,
                status,
            });
        }

        info!(
            "Started {} output for device {} ({})",
            plugin.type_id(),
            descriptor.id,
            descriptor.name
        );
        Ok(OutputBinding {
            device: descriptor.id,
            plugin,
            state: Some(SinkState(state)),
        })
    }

    pub fn shared(self) -> SharedOutput {
        Arc::new(Mutex::new(self))
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn plugin_type(&self) -> &str {
        self.plugin.type_id()
    }

    pub fn is_started(&self) -> bool {
        self.state.is_some()
    }

    /// Forward one aggregated value to the plugin.
    pub fn emit(&mut self, ts: u64, kind: ReadingKind, value: Value) -> Result<(), OutputError> {
        let state = match &self.state {
            Some(state) => state.0,
            None => return Err(OutputError::NotStarted(self.device)),
        };
        let table = self.plugin.table();

        // SAFETY: `state` came from this plugin's start and has not been stopped
        let status = unsafe {
            match (kind, value) {
                (ReadingKind::Temperature, Value::Ulong(v)) => (table.temperature)(state, ts, v),
                (ReadingKind::Humidity, Value::Ulong(v)) => (table.humidity)(state, ts, v),
                (ReadingKind::Voc, Value::Float(v)) => (table.voc)(state, ts, v),
                _ => {
                    return Err(OutputError::UnsupportedValue {
                        kind,
                        value: format!("{:?}", value),
                    })
                }
            }
        };

        if status != RET_OK {
            return Err(OutputError::EmitFailed {
                plugin_type: self.plugin.type_id().to_string(),
                device: self.device,
                kind,
                status,
            });
        }
        debug!("Device {}: {} {} at {}", self.device, kind, value, ts);
        Ok(())
    }

    /// Stop the plugin instance. The state handle is released even on failure.
    pub fn stop(&mut self) -> Result<(), OutputError> {
        let state = self
            .state
            .take()
            .ok_or(OutputError::NotStarted(self.device))?;

        // SAFETY: the handle is passed to stop exactly once
        let status = unsafe { (self.plugin.table().stop)(state.0) };
        if status != RET_OK {
            return Err(OutputError::StopFailed {
                plugin_type: self.plugin.type_id().to_string(),
                device: self.device,
                status,
            });
        }
        info!("Stopped {} output for device {}", self.plugin.type_id(), self.device);
        Ok(())
    }
}

impl Drop for OutputBinding {
    fn drop(&mut self) {
        if self.state.is_some() {
            if let Err(e) = self.stop() {
                error!("{}", e);
            }
        }
    }
}

/// Flush callback forwarding a window's averages of `kind` into `output`
pub fn flush_callback(output: SharedOutput, kind: ReadingKind) -> FlushCallback {
    Box::new(move |ts, value| {
        if let Err(e) = output.lock().emit(ts, kind, value) {
            error!("{}", e);
        }
    })
}
