use std::error::Error as StdError;
use std::ffi::CStr;

/// Errors reported by an output sink
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("no output target configured")]
    MissingTarget,

    #[error("invalid output description: {0}")]
    InvalidOutput(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn StdError + Send + Sync>),

    #[error("sink panicked")]
    Panicked,
}

impl SinkError {
    pub fn storage(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        SinkError::Storage(err.into())
    }
}

/// Borrowed view of the output description handed to `start`.
#[derive(Debug, Clone, Copy)]
pub struct Output<'a> {
    pub filename: Option<&'a str>,
    pub device_name: &'a str,
    pub device_address: &'a str,
}

/// A destination for aggregated readings.
///
/// One value is created per device binding by [`OutputSink::start`] and lives
/// until [`OutputSink::stop`].
pub trait OutputSink: Sized + Send {
    /// Output-type identifier matched against the configuration.
    const TYPE: &'static CStr;

    fn start(output: &Output<'_>) -> Result<Self, SinkError>;

    fn temperature(&mut self, ts: u64, value: u64) -> Result<(), SinkError>;

    fn humidity(&mut self, ts: u64, value: u64) -> Result<(), SinkError>;

    fn voc(&mut self, ts: u64, value: f32) -> Result<(), SinkError>;

    fn stop(self) -> Result<(), SinkError>;
}
