//! Atmotube air-quality reader.
//!
//! Notifications from Atmotube sensors are decoded, averaged per device and
//! reading kind over a configurable resolution, and handed to dynamically
//! loaded output plugins.

pub mod bluetooth;
pub mod config;
pub mod device;
pub mod error;
pub mod interval;
pub mod models;
pub mod output;
pub mod plugin;
pub mod reader;
pub mod utils;
