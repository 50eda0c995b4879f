//! Output plugin contract for the Atmotube reader.
//!
//! A plugin is a shared object exporting six C entry points (see [`abi`]).
//! Plugin authors implement [`OutputSink`] and expand [`export_output_sink!`]
//! once in a `cdylib` crate:
//!
//! ```ignore
//! atmotube_plugin::export_output_sink!(my_crate::MySink);
//! ```
//!
//! The host resolves the entry points into a [`FunctionTable`] and never looks
//! inside the state handle returned by `start`.

pub mod abi;
mod sink;

pub use abi::{FunctionTable, RawOutput, RET_ERROR, RET_OK};
pub use sink::{Output, OutputSink, SinkError};

/// Initialize logging inside a plugin.
///
/// A dynamically loaded plugin carries its own copy of the `log` facade, so the
/// host's logger does not reach it. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .try_init();
}

/// Export the six entry points of the plugin ABI for a sink type.
///
/// Expand exactly once per `cdylib`; the symbol names are fixed.
#[macro_export]
macro_rules! export_output_sink {
    ($sink:ty) => {
        /// # Safety
        /// Called by the host through the plugin ABI.
        #[no_mangle]
        pub unsafe extern "C" fn atmotube_plugin_type() -> *const ::std::ffi::c_char {
            $crate::abi::plugin_type::<$sink>()
        }

        /// # Safety
        /// `output` must point to a valid description and `state` to writable memory.
        #[no_mangle]
        pub unsafe extern "C" fn atmotube_plugin_start(
            output: *const $crate::abi::RawOutput,
            state: *mut *mut ::std::ffi::c_void,
        ) -> ::std::ffi::c_int {
            $crate::init_logging();
            $crate::abi::start::<$sink>(output, state)
        }

        /// # Safety
        /// `state` must come from `atmotube_plugin_start`.
        #[no_mangle]
        pub unsafe extern "C" fn atmotube_plugin_temperature(
            state: *mut ::std::ffi::c_void,
            ts: u64,
            value: u64,
        ) -> ::std::ffi::c_int {
            $crate::abi::temperature::<$sink>(state, ts, value)
        }

        /// # Safety
        /// `state` must come from `atmotube_plugin_start`.
        #[no_mangle]
        pub unsafe extern "C" fn atmotube_plugin_humidity(
            state: *mut ::std::ffi::c_void,
            ts: u64,
            value: u64,
        ) -> ::std::ffi::c_int {
            $crate::abi::humidity::<$sink>(state, ts, value)
        }

        /// # Safety
        /// `state` must come from `atmotube_plugin_start`.
        #[no_mangle]
        pub unsafe extern "C" fn atmotube_plugin_voc(
            state: *mut ::std::ffi::c_void,
            ts: u64,
            value: f32,
        ) -> ::std::ffi::c_int {
            $crate::abi::voc::<$sink>(state, ts, value)
        }

        /// # Safety
        /// `state` must come from `atmotube_plugin_start` and is invalid afterwards.
        #[no_mangle]
        pub unsafe extern "C" fn atmotube_plugin_stop(
            state: *mut ::std::ffi::c_void,
        ) -> ::std::ffi::c_int {
            $crate::abi::stop::<$sink>(state)
        }
    };
}
