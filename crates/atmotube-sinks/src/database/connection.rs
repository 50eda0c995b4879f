use log::debug;
use rusqlite::Connection;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS devices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        address TEXT NOT NULL,
        UNIQUE (name, address)
    );
    CREATE TABLE IF NOT EXISTS temperature (
        device_id INTEGER NOT NULL REFERENCES devices(id),
        time INTEGER NOT NULL,
        value INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS humidity (
        device_id INTEGER NOT NULL REFERENCES devices(id),
        time INTEGER NOT NULL,
        value INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS voc (
        device_id INTEGER NOT NULL REFERENCES devices(id),
        time INTEGER NOT NULL,
        value REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_temperature_device_time ON temperature(device_id, time);
    CREATE INDEX IF NOT EXISTS idx_humidity_device_time ON humidity(device_id, time);
    CREATE INDEX IF NOT EXISTS idx_voc_device_time ON voc(device_id, time);
";

/// Open (or create) the database file and make sure the schema exists.
pub fn open_database(path: &str) -> Result<Connection, rusqlite::Error> {
    debug!("Opening SQLite database at {}", path);
    let conn = Connection::open(path)?;
    create_tables(&conn)?;
    Ok(conn)
}

/// Create the device and reading tables. Idempotent.
pub fn create_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)
}
