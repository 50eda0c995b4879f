/// Atmotube GATT characteristics and notification payload decoding
use bluer::Uuid;
use log::trace;

use crate::error::DecodeError;
use crate::models::{Reading, ReadingKind, SamplingMode, Status};
use crate::utils::hex_dump;

// Atmotube GATT layout
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xdb450001_8e9a_4818_add7_6ed94a328ab2);
pub const VOC_UUID: Uuid = Uuid::from_u128(0xdb450002_8e9a_4818_add7_6ed94a328ab2);
pub const HUMIDITY_UUID: Uuid = Uuid::from_u128(0xdb450003_8e9a_4818_add7_6ed94a328ab2);
pub const TEMPERATURE_UUID: Uuid = Uuid::from_u128(0xdb450004_8e9a_4818_add7_6ed94a328ab2);
pub const STATUS_UUID: Uuid = Uuid::from_u128(0xdb450005_8e9a_4818_add7_6ed94a328ab2);

// Status byte layout
const STATUS_SLOW_MODE: u8 = 0x80; // bit 7: 30 s sampling instead of 3 s
const STATUS_CALIBRATING: u8 = 0x40; // bit 6
const STATUS_CHARGING: u8 = 0x08; // bit 3
const STATUS_BATTERY_MASK: u8 = 0x07; // bits 2-0
const BATTERY_STEP_PERCENT: u8 = 25;

/// Reading kind carried by a characteristic, `None` for foreign UUIDs
pub fn reading_kind(uuid: &Uuid) -> Option<ReadingKind> {
    match *uuid {
        VOC_UUID => Some(ReadingKind::Voc),
        HUMIDITY_UUID => Some(ReadingKind::Humidity),
        TEMPERATURE_UUID => Some(ReadingKind::Temperature),
        STATUS_UUID => Some(ReadingKind::Status),
        _ => None,
    }
}

pub fn characteristic_uuid(kind: ReadingKind) -> Uuid {
    match kind {
        ReadingKind::Voc => VOC_UUID,
        ReadingKind::Humidity => HUMIDITY_UUID,
        ReadingKind::Temperature => TEMPERATURE_UUID,
        ReadingKind::Status => STATUS_UUID,
    }
}

/// Decode a notification payload of the given kind.
///
/// Bytes beyond what a kind needs are ignored.
pub fn decode(kind: ReadingKind, data: &[u8]) -> Result<Reading, DecodeError> {
    trace!("{} payload: [{}]", kind, hex_dump(data));
    match kind {
        ReadingKind::Voc => decode_voc(data).map(Reading::Voc),
        ReadingKind::Humidity => decode_humidity(data).map(Reading::Humidity),
        ReadingKind::Temperature => decode_temperature(data).map(Reading::Temperature),
        ReadingKind::Status => decode_status(data).map(Reading::Status),
    }
}

fn require(kind: ReadingKind, data: &[u8], needed: usize) -> Result<(), DecodeError> {
    if data.len() < needed {
        return Err(DecodeError::InsufficientData {
            kind,
            needed,
            got: data.len(),
        });
    }
    Ok(())
}

/// VOC concentration in ppm: big-endian hundredths in bytes 0-1
pub fn decode_voc(data: &[u8]) -> Result<f32, DecodeError> {
    require(ReadingKind::Voc, data, 2)?;
    let raw = u16::from_be_bytes([data[0], data[1]]);
    Ok(f32::from(raw) / 100.0)
}

/// Relative humidity in percent
pub fn decode_humidity(data: &[u8]) -> Result<u8, DecodeError> {
    require(ReadingKind::Humidity, data, 1)?;
    Ok(data[0])
}

/// Temperature in whole degrees Celsius
pub fn decode_temperature(data: &[u8]) -> Result<u8, DecodeError> {
    require(ReadingKind::Temperature, data, 1)?;
    Ok(data[0])
}

pub fn decode_status(data: &[u8]) -> Result<Status, DecodeError> {
    require(ReadingKind::Status, data, 1)?;
    let byte = data[0];
    let battery_level = byte & STATUS_BATTERY_MASK;

    Ok(Status {
        mode: if byte & STATUS_SLOW_MODE != 0 {
            SamplingMode::Slow
        } else {
            SamplingMode::Fast
        },
        calibrating: byte & STATUS_CALIBRATING != 0,
        charging: byte & STATUS_CHARGING != 0,
        battery_level,
        battery_percent: battery_level * BATTERY_STEP_PERCENT,
    })
}
