#![allow(dead_code)]

use atmotube::error::PluginError;
use atmotube::models::{DeviceDescriptor, DeviceId};
use atmotube::plugin::{LoadedModule, ModuleLoader};
use atmotube_plugin::FunctionTable;
use atmotube_sinks::{FileSink, SqliteSink};
use std::collections::HashMap;
use std::path::Path;
use tempfile::TempDir;

pub const FILE_PLUGIN: &str = "libatmotube_plugin_file.so";
pub const SQLITE_PLUGIN: &str = "libatmotube_plugin_sqlite.so";

/// Hands out in-process function tables in place of shared objects, keyed by file name.
#[derive(Default)]
pub struct TableLoader {
    tables: HashMap<String, FunctionTable>,
}

impl TableLoader {
    pub fn with(mut self, file_name: &str, table: FunctionTable) -> Self {
        self.tables.insert(file_name.to_string(), table);
        self
    }

    /// The two sinks shipped with the reader
    pub fn builtin() -> Self {
        Self::default()
            .with(FILE_PLUGIN, FunctionTable::of::<FileSink>())
            .with(SQLITE_PLUGIN, FunctionTable::of::<SqliteSink>())
    }
}

impl ModuleLoader for TableLoader {
    fn load(&self, path: &Path) -> Result<LoadedModule, PluginError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        self.tables
            .get(name)
            .copied()
            .map(LoadedModule::in_process)
            .ok_or_else(|| PluginError::MissingSymbol {
                path: path.to_path_buf(),
                symbol: "atmotube_plugin_voc".to_string(),
            })
    }
}

/// A directory holding empty placeholder files for the loader to pick up.
pub fn plugin_dir(files: &[&str]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for file in files {
        std::fs::write(dir.path().join(file), b"").unwrap();
    }
    dir
}

pub fn address(id: DeviceId) -> String {
    format!("F7:35:49:55:35:{:02X}", id)
}

pub fn descriptor(id: DeviceId, output_type: &str, target: Option<&Path>) -> DeviceDescriptor {
    DeviceDescriptor {
        id,
        name: format!("atmotube-{}", id),
        address: address(id),
        description: String::new(),
        resolution_ms: 500,
        output_type: output_type.to_string(),
        output_target: target.map(|p| p.to_string_lossy().into_owned()),
    }
}
