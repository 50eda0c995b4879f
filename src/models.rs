use std::fmt;

use crate::interval::Format;

/// Identifier assigned to a device when the configuration is loaded
pub type DeviceId = u32;

/// Shortest accepted sampling resolution in milliseconds
pub const MIN_RESOLUTION_MS: u64 = 100;
/// Longest accepted sampling resolution in milliseconds
pub const MAX_RESOLUTION_MS: u64 = 60 * 1000;
/// Resolution used when the configuration does not name one
pub const DEFAULT_RESOLUTION_MS: u64 = 1000;

/// Static identity and output policy of one configured sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    pub address: String,
    pub description: String,
    pub resolution_ms: u64,
    pub output_type: String,
    pub output_target: Option<String>,
}

/// The four notification kinds an Atmotube emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReadingKind {
    Voc,
    Humidity,
    Temperature,
    Status,
}

impl ReadingKind {
    pub const ALL: [ReadingKind; 4] = [
        ReadingKind::Voc,
        ReadingKind::Humidity,
        ReadingKind::Temperature,
        ReadingKind::Status,
    ];

    /// Kinds that are averaged over an interval window
    pub const AGGREGATED: [ReadingKind; 3] = [
        ReadingKind::Voc,
        ReadingKind::Humidity,
        ReadingKind::Temperature,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ReadingKind::Voc => "voc",
            ReadingKind::Humidity => "humidity",
            ReadingKind::Temperature => "temperature",
            ReadingKind::Status => "status",
        }
    }

    /// Window format for aggregated kinds, `None` for status
    pub fn format(self) -> Option<Format> {
        match self {
            ReadingKind::Voc => Some(Format::Float),
            ReadingKind::Humidity | ReadingKind::Temperature => Some(Format::Ulong),
            ReadingKind::Status => None,
        }
    }
}

impl fmt::Display for ReadingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-device connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Unregistering,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Registered | ConnectionState::Unregistering
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// One sample every 3 seconds
    Fast,
    /// One sample every 30 seconds
    Slow,
}

/// Decoded status characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub mode: SamplingMode,
    pub calibrating: bool,
    pub charging: bool,
    /// Raw 3-bit level, 0-7
    pub battery_level: u8,
    /// `battery_level * 25`, not clamped to 100
    pub battery_percent: u8,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mode: {}, dev: {}, power: {}, battery: {}%",
            match self.mode {
                SamplingMode::Fast => "fast",
                SamplingMode::Slow => "slow",
            },
            if self.calibrating { "calibrating" } else { "ready" },
            if self.charging { "charging" } else { "not charging" },
            self.battery_percent
        )
    }
}

/// A decoded notification
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Volatile organic compounds, ppm
    Voc(f32),
    /// Relative humidity, percent
    Humidity(u8),
    /// Degrees Celsius
    Temperature(u8),
    Status(Status),
}

impl Reading {
    pub fn kind(&self) -> ReadingKind {
        match self {
            Reading::Voc(_) => ReadingKind::Voc,
            Reading::Humidity(_) => ReadingKind::Humidity,
            Reading::Temperature(_) => ReadingKind::Temperature,
            Reading::Status(_) => ReadingKind::Status,
        }
    }
}
