//! Turning a shared object on disk into a resolved function table.

use atmotube_plugin::abi::{
    FloatFn, StartFn, StopFn, TypeFn, UlongFn, SYMBOL_HUMIDITY, SYMBOL_START, SYMBOL_STOP,
    SYMBOL_TEMPERATURE, SYMBOL_TYPE, SYMBOL_VOC,
};
use atmotube_plugin::FunctionTable;
use libloading::Library;
use log::debug;
use std::any::Any;
use std::fmt;
use std::path::Path;

use crate::error::PluginError;

/// Something that keeps a module's code mapped while it is alive
pub type ModuleHandle = Box<dyn Any + Send + Sync>;

/// A module whose entry points have all been resolved
pub struct LoadedModule {
    pub table: FunctionTable,
    handle: Option<ModuleHandle>,
}

impl LoadedModule {
    /// Tie `table` to the handle that keeps its code loaded.
    pub fn new(table: FunctionTable, handle: impl Any + Send + Sync) -> Self {
        LoadedModule {
            table,
            handle: Some(Box::new(handle)),
        }
    }

    /// A table whose code is linked into the current binary.
    pub fn in_process(table: FunctionTable) -> Self {
        LoadedModule {
            table,
            handle: None,
        }
    }

    pub(crate) fn into_parts(self) -> (FunctionTable, Option<ModuleHandle>) {
        (self.table, self.handle)
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("in_process", &self.handle.is_none())
            .finish_non_exhaustive()
    }
}

pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedModule, PluginError>;
}

/// Loads plugins with the system dynamic linker
#[derive(Debug, Default, Clone, Copy)]
pub struct LibraryLoader;

impl ModuleLoader for LibraryLoader {
    fn load(&self, path: &Path) -> Result<LoadedModule, PluginError> {
        // SAFETY: running a plugin's initialisers is inherent to loading it
        let library = unsafe { Library::new(path) }.map_err(|source| PluginError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        // SAFETY: the typedefs mirror the exported signatures, and the copied
        // pointers stay valid because `library` travels with them
        let table = unsafe {
            FunctionTable {
                plugin_type: symbol::<TypeFn>(&library, path, SYMBOL_TYPE)?,
                start: symbol::<StartFn>(&library, path, SYMBOL_START)?,
                temperature: symbol::<UlongFn>(&library, path, SYMBOL_TEMPERATURE)?,
                humidity: symbol::<UlongFn>(&library, path, SYMBOL_HUMIDITY)?,
                voc: symbol::<FloatFn>(&library, path, SYMBOL_VOC)?,
                stop: symbol::<StopFn>(&library, path, SYMBOL_STOP)?,
            }
        };

        debug!("Resolved all entry points of {}", path.display());
        Ok(LoadedModule::new(table, library))
    }
}

unsafe fn symbol<T: Copy>(library: &Library, path: &Path, name: &[u8]) -> Result<T, PluginError> {
    library
        .get::<T>(name)
        .map(|resolved| *resolved)
        .map_err(|_| PluginError::MissingSymbol {
            path: path.to_path_buf(),
            symbol: symbol_name(name),
        })
}

fn symbol_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned()
}
