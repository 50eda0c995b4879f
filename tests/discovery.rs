mod common;

use atmotube::error::PluginError;
use atmotube::plugin::{LibraryLoader, PluginRegistry};
use atmotube_plugin::FunctionTable;
use atmotube_sinks::FileSink;

use common::{plugin_dir, TableLoader, FILE_PLUGIN};

#[test]
fn broken_module_is_skipped() {
    // the loader has no table for the second file, as if its voc entry point were missing
    let dir = plugin_dir(&[FILE_PLUGIN, "libatmotube_plugin_broken.so"]);
    let mut registry = PluginRegistry::with_loader(
        TableLoader::default().with(FILE_PLUGIN, FunctionTable::of::<FileSink>()),
    );

    assert_eq!(registry.discover(dir.path()).unwrap(), 1);
    assert_eq!(registry.types(), vec!["file"]);
    assert!(registry.resolve("file").is_some());
    assert!(registry.resolve("broken").is_none());
    assert!(registry.resolve("sqlite").is_none());
}

#[test]
fn only_broken_modules_means_no_plugins() {
    let dir = plugin_dir(&["libatmotube_plugin_broken.so"]);
    let mut registry = PluginRegistry::with_loader(TableLoader::default());
    assert!(matches!(
        registry.discover(dir.path()),
        Err(PluginError::NoPlugins(_))
    ));
}

#[test]
fn real_loader_skips_files_that_are_not_libraries() {
    let dir = plugin_dir(&["libatmotube_plugin_empty.so"]);
    let mut registry = PluginRegistry::with_loader(LibraryLoader);
    assert!(matches!(
        registry.discover(dir.path()),
        Err(PluginError::NoPlugins(_))
    ));
    assert!(registry.is_empty());
}

#[test]
fn scan_is_bounded() {
    let names: Vec<String> = (0..300)
        .map(|i| format!("libatmotube_plugin_{:03}.so", i))
        .collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let dir = plugin_dir(&refs);

    let mut loader = TableLoader::default();
    for name in &names {
        loader = loader.with(name, FunctionTable::of::<FileSink>());
    }
    let mut registry = PluginRegistry::with_loader(loader);

    // every module advertises "file", so only the first one loaded is kept
    assert_eq!(registry.discover(dir.path()).unwrap(), 1);
    assert_eq!(registry.len(), 1);
}
