//! Raw C-level plugin contract.
//!
//! | Symbol                        | Signature                                     |
//! |-------------------------------|-----------------------------------------------|
//! | `atmotube_plugin_type`        | `() -> *const c_char`                         |
//! | `atmotube_plugin_start`       | `(*const RawOutput, *mut *mut c_void) -> c_int` |
//! | `atmotube_plugin_temperature` | `(*mut c_void, u64, u64) -> c_int`            |
//! | `atmotube_plugin_humidity`    | `(*mut c_void, u64, u64) -> c_int`            |
//! | `atmotube_plugin_voc`         | `(*mut c_void, u64, f32) -> c_int`            |
//! | `atmotube_plugin_stop`        | `(*mut c_void) -> c_int`                      |
//!
//! Every status-returning entry point yields [`RET_OK`] on success. Strings in
//! [`RawOutput`] are only valid for the duration of the start call.

use log::error;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};

use crate::sink::{Output, OutputSink, SinkError};

pub const RET_OK: c_int = 0;
pub const RET_ERROR: c_int = 1;

pub const SYMBOL_TYPE: &[u8] = b"atmotube_plugin_type\0";
pub const SYMBOL_START: &[u8] = b"atmotube_plugin_start\0";
pub const SYMBOL_TEMPERATURE: &[u8] = b"atmotube_plugin_temperature\0";
pub const SYMBOL_HUMIDITY: &[u8] = b"atmotube_plugin_humidity\0";
pub const SYMBOL_VOC: &[u8] = b"atmotube_plugin_voc\0";
pub const SYMBOL_STOP: &[u8] = b"atmotube_plugin_stop\0";

/// Output description passed to `start`. `filename` may be null.
#[repr(C)]
#[derive(Debug)]
pub struct RawOutput {
    pub filename: *const c_char,
    pub device_name: *const c_char,
    pub device_address: *const c_char,
}

pub type TypeFn = unsafe extern "C" fn() -> *const c_char;
pub type StartFn = unsafe extern "C" fn(output: *const RawOutput, state: *mut *mut c_void) -> c_int;
pub type UlongFn = unsafe extern "C" fn(state: *mut c_void, ts: u64, value: u64) -> c_int;
pub type FloatFn = unsafe extern "C" fn(state: *mut c_void, ts: u64, value: f32) -> c_int;
pub type StopFn = unsafe extern "C" fn(state: *mut c_void) -> c_int;

/// Entry points resolved from one plugin.
#[derive(Debug, Clone, Copy)]
pub struct FunctionTable {
    pub plugin_type: TypeFn,
    pub start: StartFn,
    pub temperature: UlongFn,
    pub humidity: UlongFn,
    pub voc: FloatFn,
    pub stop: StopFn,
}

impl FunctionTable {
    /// Table for a sink linked into the current binary.
    pub fn of<S: OutputSink>() -> Self {
        FunctionTable {
            plugin_type: plugin_type::<S>,
            start: start::<S>,
            temperature: temperature::<S>,
            humidity: humidity::<S>,
            voc: voc::<S>,
            stop: stop::<S>,
        }
    }
}

impl<'a> Output<'a> {
    /// # Safety
    /// Non-null pointers in `raw` must reference NUL-terminated strings living for `'a`.
    pub unsafe fn from_raw(raw: &'a RawOutput) -> Result<Self, SinkError> {
        let filename = if raw.filename.is_null() {
            None
        } else {
            Some(str_from(raw.filename, "filename is not UTF-8")?)
        };
        if raw.device_name.is_null() || raw.device_address.is_null() {
            return Err(SinkError::InvalidOutput("missing device identity"));
        }
        Ok(Output {
            filename,
            device_name: str_from(raw.device_name, "device name is not UTF-8")?,
            device_address: str_from(raw.device_address, "device address is not UTF-8")?,
        })
    }
}

unsafe fn str_from<'a>(ptr: *const c_char, what: &'static str) -> Result<&'a str, SinkError> {
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| SinkError::InvalidOutput(what))
}

fn guarded<T>(f: impl FnOnce() -> Result<T, SinkError>) -> Result<T, SinkError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_) => Err(SinkError::Panicked),
    }
}

fn status<S: OutputSink>(operation: &str, result: Result<(), SinkError>) -> c_int {
    match result {
        Ok(()) => RET_OK,
        Err(e) => {
            error!("{} sink: {} failed: {}", S::TYPE.to_string_lossy(), operation, e);
            RET_ERROR
        }
    }
}

unsafe fn with_sink<S, F>(state: *mut c_void, operation: &str, f: F) -> c_int
where
    S: OutputSink,
    F: FnOnce(&mut S) -> Result<(), SinkError>,
{
    match state.cast::<S>().as_mut() {
        Some(sink) => status::<S>(operation, guarded(|| f(sink))),
        None => {
            error!("{} sink: {} called without state", S::TYPE.to_string_lossy(), operation);
            RET_ERROR
        }
    }
}

/// # Safety
/// Always safe; `unsafe` only to match [`TypeFn`].
pub unsafe extern "C" fn plugin_type<S: OutputSink>() -> *const c_char {
    S::TYPE.as_ptr()
}

/// # Safety
/// `output` must be null or valid for the call; `state` must be null or writable.
pub unsafe extern "C" fn start<S: OutputSink>(
    output: *const RawOutput,
    state: *mut *mut c_void,
) -> c_int {
    if output.is_null() || state.is_null() {
        error!("{} sink: start called with null arguments", S::TYPE.to_string_lossy());
        return RET_ERROR;
    }

    let started = guarded(|| {
        let output = Output::from_raw(&*output)?;
        S::start(&output)
    });

    match started {
        Ok(sink) => {
            *state = Box::into_raw(Box::new(sink)).cast();
            RET_OK
        }
        Err(e) => {
            error!("{} sink: start failed: {}", S::TYPE.to_string_lossy(), e);
            RET_ERROR
        }
    }
}

/// # Safety
/// `state` must be null or a handle returned by [`start`] for the same `S`.
pub unsafe extern "C" fn temperature<S: OutputSink>(state: *mut c_void, ts: u64, value: u64) -> c_int {
    with_sink::<S, _>(state, "temperature", |sink| sink.temperature(ts, value))
}

/// # Safety
/// `state` must be null or a handle returned by [`start`] for the same `S`.
pub unsafe extern "C" fn humidity<S: OutputSink>(state: *mut c_void, ts: u64, value: u64) -> c_int {
    with_sink::<S, _>(state, "humidity", |sink| sink.humidity(ts, value))
}

/// # Safety
/// `state` must be null or a handle returned by [`start`] for the same `S`.
pub unsafe extern "C" fn voc<S: OutputSink>(state: *mut c_void, ts: u64, value: f32) -> c_int {
    with_sink::<S, _>(state, "voc", |sink| sink.voc(ts, value))
}

/// # Safety
/// `state` must be null or a handle returned by [`start`] for the same `S`;
/// it is freed by this call.
pub unsafe extern "C" fn stop<S: OutputSink>(state: *mut c_void) -> c_int {
    if state.is_null() {
        error!("{} sink: stop called in invalid state", S::TYPE.to_string_lossy());
        return RET_ERROR;
    }
    let sink = Box::from_raw(state.cast::<S>());
    status::<S>("stop", guarded(move || sink.stop()))
}
