use log::{debug, info};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::models::{
    DeviceDescriptor, DeviceId, DEFAULT_RESOLUTION_MS, MAX_RESOLUTION_MS, MIN_RESOLUTION_MS,
};

/// Plugin directory used when neither the file nor the environment names one
pub const DEFAULT_PLUGIN_PATH: &str = "/usr/local/lib/atmotube";

const CONFIG_ENV: &str = "ATMOTUBE_CONFIG";
const PLUGIN_PATH_ENV: &str = "ATMOTUBE_PLUGIN_PATH";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    plugin_path: Option<PathBuf>,
    #[serde(default, rename = "device")]
    devices: Vec<RawDevice>,
    #[serde(default, rename = "output")]
    outputs: Vec<RawOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDevice {
    name: Option<String>,
    address: Option<String>,
    description: Option<String>,
    resolution: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOutput {
    device: String,
    #[serde(rename = "type")]
    output_type: String,
    filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub plugin_path: PathBuf,
    /// In file order; ids are assigned from that order
    pub devices: Vec<DeviceDescriptor>,
}

impl Config {
    /// Load `.env`, locate the config file and parse it.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let path = config_path(
            explicit,
            env::var(CONFIG_ENV).ok(),
            env::var("HOME").ok(),
        )?;
        info!("Loading configuration from {}", path.display());

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let mut config = Self::from_toml(&text)?;

        if let Ok(plugin_path) = env::var(PLUGIN_PATH_ENV) {
            debug!("{} overrides plugin path", PLUGIN_PATH_ENV);
            config.plugin_path = PathBuf::from(plugin_path);
        }

        for device in &config.devices {
            info!(
                "Device {}: {} ({}) every {} ms -> {}",
                device.id, device.name, device.address, device.resolution_ms, device.output_type
            );
        }
        Ok(config)
    }

    /// Parse and validate a config document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let mut devices = validate_devices(raw.devices)?;
        attach_outputs(&mut devices, raw.outputs)?;

        Ok(Config {
            plugin_path: raw
                .plugin_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PLUGIN_PATH)),
            devices,
        })
    }
}

/// `--config`, then `$ATMOTUBE_CONFIG`, then `$HOME/.atmotube/config.toml`
pub fn config_path(
    explicit: Option<&Path>,
    from_env: Option<String>,
    home: Option<String>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = from_env.filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    home.filter(|h| !h.is_empty())
        .map(|home| Path::new(&home).join(".atmotube").join("config.toml"))
        .ok_or(ConfigError::NoConfigPath)
}

fn required(value: Option<String>, index: usize, field: &'static str) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingField { index, field })
}

fn validate_devices(raw: Vec<RawDevice>) -> Result<Vec<DeviceDescriptor>, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::NoDevices);
    }

    let mut names = HashSet::new();
    let mut devices = Vec::with_capacity(raw.len());
    for (index, device) in raw.into_iter().enumerate() {
        let name = required(device.name, index, "name")?;
        let address = required(device.address, index, "address")?;

        if !names.insert(name.clone()) {
            return Err(ConfigError::DuplicateDevice(name));
        }

        let resolution_ms = device.resolution.unwrap_or(DEFAULT_RESOLUTION_MS);
        if !(MIN_RESOLUTION_MS..=MAX_RESOLUTION_MS).contains(&resolution_ms) {
            return Err(ConfigError::InvalidResolution {
                device: name,
                value: resolution_ms,
                min: MIN_RESOLUTION_MS,
                max: MAX_RESOLUTION_MS,
            });
        }

        devices.push(DeviceDescriptor {
            id: index as DeviceId,
            name,
            address,
            description: device.description.unwrap_or_default(),
            resolution_ms,
            output_type: String::new(),
            output_target: None,
        });
    }
    Ok(devices)
}

fn attach_outputs(devices: &mut [DeviceDescriptor], outputs: Vec<RawOutput>) -> Result<(), ConfigError> {
    if devices.len() != outputs.len() {
        return Err(ConfigError::OutputCountMismatch {
            devices: devices.len(),
            outputs: outputs.len(),
        });
    }

    for output in outputs {
        let device = devices
            .iter_mut()
            .find(|d| d.name == output.device)
            .ok_or_else(|| ConfigError::UnknownOutputDevice(output.device.clone()))?;

        if !device.output_type.is_empty() {
            return Err(ConfigError::DuplicateOutput(output.device));
        }
        let output_type = output.output_type.trim();
        if output_type.is_empty() {
            return Err(ConfigError::MissingOutputType(output.device));
        }

        device.output_type = output_type.to_string();
        device.output_target = output.filename.filter(|f| !f.is_empty());
    }
    Ok(())
}
