//! Error types for every stage of the pipeline.

use std::path::PathBuf;

use bluer::Uuid;

use crate::interval::{Format, IntervalKey};
use crate::models::{DeviceId, ReadingKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{kind} payload too short: need {needed} byte(s), got {got}")]
    InsufficientData {
        kind: ReadingKind,
        needed: usize,
        got: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntervalError {
    #[error("unsupported interval format {0:?}")]
    UnsupportedFormat(String),

    #[error("interval {0} already exists")]
    AlreadyExists(IntervalKey),

    #[error("interval {0} not found")]
    NotFound(IntervalKey),

    #[error("interval {key} expects {expected:?} samples")]
    FormatMismatch { key: IntervalKey, expected: Format },

    #[error("interval {0} needs a non-zero period")]
    ZeroPeriod(IntervalKey),
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("failed to read plugin directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("{path} does not export {symbol}")]
    MissingSymbol { path: PathBuf, symbol: String },

    #[error("{0} reports an invalid type identifier")]
    InvalidType(PathBuf),

    #[error("{path} provides type {plugin_type:?}, which is already loaded")]
    Duplicate { path: PathBuf, plugin_type: String },

    #[error("no usable plugins found in {0}")]
    NoPlugins(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("output field contains a NUL byte: {0}")]
    InvalidString(#[from] std::ffi::NulError),

    #[error("{plugin_type} plugin failed to start for device {device} (status {status})")]
    StartFailed {
        plugin_type: String,
        device: DeviceId,
        status: i32,
    },

    #[error("{plugin_type} plugin failed to stop for device {device} (status {status})")]
    StopFailed {
        plugin_type: String,
        device: DeviceId,
        status: i32,
    },

    #[error("{plugin_type} plugin failed to store {kind} for device {device} (status {status})")]
    EmitFailed {
        plugin_type: String,
        device: DeviceId,
        kind: ReadingKind,
        status: i32,
    },

    #[error("{kind} readings cannot be emitted as {value}")]
    UnsupportedValue { kind: ReadingKind, value: String },

    #[error("output for device {0} is not started")]
    NotStarted(DeviceId),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),

    #[error("invalid device address {0:?}")]
    InvalidAddress(String),

    #[error("services of {0} were not resolved in time")]
    ServicesUnresolved(String),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("not subscribed to {0}")]
    NotSubscribed(Uuid),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("{failed} of {total} device(s) failed to {operation}")]
    Partial {
        operation: &'static str,
        failed: usize,
        total: usize,
    },

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("gave up connecting after {0} attempt(s)")]
    RetriesExhausted(u32),

    #[error("device {0} is not connected")]
    NotConnected(DeviceId),

    #[error(transparent)]
    Interval(#[from] IntervalError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot locate config file: neither ATMOTUBE_CONFIG nor HOME is set")]
    NoConfigPath,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no devices configured")]
    NoDevices,

    #[error("device #{index}: {field} must be set")]
    MissingField { index: usize, field: &'static str },

    #[error("device {0:?} is configured more than once")]
    DuplicateDevice(String),

    #[error("device {device:?}: resolution {value} ms outside [{min}, {max}]")]
    InvalidResolution {
        device: String,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{devices} device(s) but {outputs} output(s) configured")]
    OutputCountMismatch { devices: usize, outputs: usize },

    #[error("device {0:?} has more than one output")]
    DuplicateOutput(String),

    #[error("output refers to unknown device {0:?}")]
    UnknownOutputDevice(String),

    #[error("output for device {0:?} has an empty type")]
    MissingOutputType(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("no devices configured")]
    NoDevices,

    #[error("device {device} uses output type {output_type:?}, but no plugin provides it")]
    UnknownOutputType {
        device: DeviceId,
        output_type: String,
    },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}
