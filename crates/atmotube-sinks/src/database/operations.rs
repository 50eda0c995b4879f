/// Database operations for devices and aggregated readings
use rusqlite::{params, Connection, ToSql};

/// Reading tables, one per numeric reading kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingTable {
    Temperature,
    Humidity,
    Voc,
}

impl ReadingTable {
    fn insert_sql(self) -> &'static str {
        match self {
            ReadingTable::Temperature => {
                "INSERT INTO temperature(device_id, time, value) VALUES (?1, ?2, ?3)"
            }
            ReadingTable::Humidity => {
                "INSERT INTO humidity(device_id, time, value) VALUES (?1, ?2, ?3)"
            }
            ReadingTable::Voc => "INSERT INTO voc(device_id, time, value) VALUES (?1, ?2, ?3)",
        }
    }
}

/// Look up a device row by its (name, address) pair
///
/// # Returns
/// The row id, or `None` if the device has never been stored
pub fn find_device(
    conn: &Connection,
    name: &str,
    address: &str,
) -> Result<Option<i64>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT id FROM devices WHERE name = ?1 AND address = ?2")?;
    let mut rows = stmt.query(params![name, address])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Insert a device row
///
/// # Returns
/// The id of the new row; fails if the (name, address) pair already exists
pub fn insert_device(conn: &Connection, name: &str, address: &str) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO devices(name, address) VALUES (?1, ?2)",
        params![name, address],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Find the device row, inserting it first if needed
pub fn resolve_device(conn: &Connection, name: &str, address: &str) -> Result<i64, rusqlite::Error> {
    match find_device(conn, name, address)? {
        Some(id) => Ok(id),
        None => insert_device(conn, name, address),
    }
}

/// Store one aggregated reading for a device
///
/// # Arguments
/// * `table` - Reading kind to store into
/// * `device_id` - Row id from [`resolve_device`]
/// * `ts` - Timestamp in milliseconds since the Unix epoch
/// * `value` - Aggregated value
pub fn insert_reading(
    conn: &Connection,
    table: ReadingTable,
    device_id: i64,
    ts: u64,
    value: &dyn ToSql,
) -> Result<(), rusqlite::Error> {
    let time = i64::try_from(ts).unwrap_or(i64::MAX);
    conn.execute(table.insert_sql(), params![device_id, time, value])?;
    Ok(())
}
