pub mod connection;
pub mod operations;

use atmotube_plugin::{Output, OutputSink, SinkError};
use log::info;
use rusqlite::Connection;
use std::ffi::CStr;

pub use connection::{create_tables, open_database};
pub use operations::{find_device, insert_device, insert_reading, resolve_device, ReadingTable};

/// Stores readings in a SQLite database, one table per reading kind.
#[derive(Debug)]
pub struct SqliteSink {
    conn: Connection,
    device_id: i64,
}

impl SqliteSink {
    pub fn device_id(&self) -> i64 {
        self.device_id
    }
}

impl OutputSink for SqliteSink {
    const TYPE: &'static CStr = c"sqlite";

    fn start(output: &Output<'_>) -> Result<Self, SinkError> {
        let filename = output.filename.ok_or(SinkError::MissingTarget)?;
        let conn = open_database(filename).map_err(SinkError::storage)?;
        let device_id = resolve_device(&conn, output.device_name, output.device_address)
            .map_err(SinkError::storage)?;

        info!(
            "Storing readings from {} ({}) in {} as device {}",
            output.device_name, output.device_address, filename, device_id
        );
        Ok(SqliteSink { conn, device_id })
    }

    fn temperature(&mut self, ts: u64, value: u64) -> Result<(), SinkError> {
        let value = i64::try_from(value).unwrap_or(i64::MAX);
        insert_reading(&self.conn, ReadingTable::Temperature, self.device_id, ts, &value)
            .map_err(SinkError::storage)
    }

    fn humidity(&mut self, ts: u64, value: u64) -> Result<(), SinkError> {
        let value = i64::try_from(value).unwrap_or(i64::MAX);
        insert_reading(&self.conn, ReadingTable::Humidity, self.device_id, ts, &value)
            .map_err(SinkError::storage)
    }

    fn voc(&mut self, ts: u64, value: f32) -> Result<(), SinkError> {
        insert_reading(&self.conn, ReadingTable::Voc, self.device_id, ts, &f64::from(value))
            .map_err(SinkError::storage)
    }

    fn stop(self) -> Result<(), SinkError> {
        self.conn
            .close()
            .map_err(|(_, e)| SinkError::storage(e))
    }
}
