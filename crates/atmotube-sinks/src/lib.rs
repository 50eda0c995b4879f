//! Output sinks shipped with the Atmotube reader.
//!
//! Each sink is exported as a plugin by a thin `cdylib` crate under `plugins/`.

pub mod database;
pub mod file;

pub use database::SqliteSink;
pub use file::FileSink;
