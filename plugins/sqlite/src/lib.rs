//! SQLite output plugin. Install `libatmotube_plugin_sqlite.so` into the reader's plugin directory.

atmotube_plugin::export_output_sink!(atmotube_sinks::SqliteSink);
