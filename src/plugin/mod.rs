//! Output plugin discovery and lookup.
//!
//! Plugins are scanned from one directory in file-name order. Each module must
//! export every entry point of the plugin ABI and advertise an output type not
//! already provided by an earlier module.

mod loader;

pub use loader::{LibraryLoader, LoadedModule, ModuleHandle, ModuleLoader};

use atmotube_plugin::FunctionTable;
use log::{debug, info, warn};
use std::ffi::CStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::PluginError;

/// Upper bound on directory entries inspected per scan
pub const MAX_SCAN_ENTRIES: usize = 256;

/// A loaded plugin. The module stays mapped while any clone of the record lives.
pub struct PluginRecord {
    type_id: String,
    path: PathBuf,
    table: FunctionTable,
    _module: Option<ModuleHandle>,
}

impl PluginRecord {
    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &FunctionTable {
        &self.table
    }
}

impl fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("type_id", &self.type_id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

pub struct PluginRegistry {
    loader: Box<dyn ModuleLoader>,
    plugins: Vec<Arc<PluginRecord>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    /// Registry backed by the system dynamic linker.
    pub fn new() -> Self {
        Self::with_loader(LibraryLoader)
    }

    pub fn with_loader(loader: impl ModuleLoader + 'static) -> Self {
        PluginRegistry {
            loader: Box::new(loader),
            plugins: Vec::new(),
        }
    }

    /// Load every plugin in `dir`.
    ///
    /// Unloadable or incomplete modules are skipped. Returns the number of
    /// plugins added, or [`PluginError::NoPlugins`] if the registry is still
    /// empty afterwards.
    pub fn discover(&mut self, dir: &Path) -> Result<usize, PluginError> {
        info!("Scanning {} for output plugins", dir.display());

        let entries = std::fs::read_dir(dir).map_err(|source| PluginError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut candidates: Vec<PathBuf> = entries
            .take(MAX_SCAN_ENTRIES)
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| is_plugin_library(path))
            .collect();
        candidates.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut added = 0;
        for path in candidates {
            let module = match self.loader.load(&path) {
                Ok(module) => module,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            match self.register(path.clone(), module) {
                Ok(record) => {
                    info!("Loaded {} plugin from {}", record.type_id(), path.display());
                    added += 1;
                }
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }

        if self.plugins.is_empty() {
            return Err(PluginError::NoPlugins(dir.to_path_buf()));
        }
        Ok(added)
    }

    /// Add an already loaded module. A rejected module is dropped, and with it unloaded.
    pub fn register(
        &mut self,
        path: PathBuf,
        module: LoadedModule,
    ) -> Result<Arc<PluginRecord>, PluginError> {
        let (table, handle) = module.into_parts();
        let type_id = advertised_type(&table).ok_or_else(|| PluginError::InvalidType(path.clone()))?;

        if self.resolve(&type_id).is_some() {
            return Err(PluginError::Duplicate {
                path,
                plugin_type: type_id,
            });
        }

        let record = Arc::new(PluginRecord {
            type_id,
            path,
            table,
            _module: handle,
        });
        self.plugins.push(Arc::clone(&record));
        Ok(record)
    }

    pub fn resolve(&self, type_id: &str) -> Option<Arc<PluginRecord>> {
        self.plugins
            .iter()
            .find(|record| record.type_id == type_id)
            .cloned()
    }

    /// Release every plugin. Modules still bound to an output stay mapped
    /// until that output is dropped.
    pub fn unload_all(&mut self) {
        for record in self.plugins.drain(..) {
            if Arc::strong_count(&record) > 1 {
                warn!("{} plugin is still in use, deferring unload", record.type_id);
            } else {
                debug!("Unloading {} plugin", record.type_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Advertised types in load order
    pub fn types(&self) -> Vec<&str> {
        self.plugins.iter().map(|record| record.type_id()).collect()
    }
}

fn is_plugin_library(path: &Path) -> bool {
    path.is_file()
        && path.extension().and_then(|e| e.to_str()) == Some(std::env::consts::DLL_EXTENSION)
}

fn advertised_type(table: &FunctionTable) -> Option<String> {
    // SAFETY: the ABI requires a static NUL-terminated string or null
    let name = unsafe {
        let ptr = (table.plugin_type)();
        if ptr.is_null() {
            return None;
        }
        CStr::from_ptr(ptr)
    };
    name.to_str()
        .ok()
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
}
