/// Append-only text file output
use atmotube_plugin::{Output, OutputSink, SinkError};
use log::{debug, info};
use std::ffi::CStr;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Writes one `timestamp,kind,value` line per reading and flushes it immediately.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    fn append(&mut self, ts: u64, kind: &str, value: impl Display) -> Result<(), SinkError> {
        debug!("Writing {} to {}: {},{}", kind, self.path.display(), ts, value);
        writeln!(self.writer, "{},{},{}", ts, kind, value)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl OutputSink for FileSink {
    const TYPE: &'static CStr = c"file";

    fn start(output: &Output<'_>) -> Result<Self, SinkError> {
        let path = PathBuf::from(output.filename.ok_or(SinkError::MissingTarget)?);

        info!(
            "Opening {} for appending readings from {} ({})",
            path.display(),
            output.device_name,
            output.device_address
        );

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(FileSink {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn temperature(&mut self, ts: u64, value: u64) -> Result<(), SinkError> {
        self.append(ts, "temperature", value)
    }

    fn humidity(&mut self, ts: u64, value: u64) -> Result<(), SinkError> {
        self.append(ts, "humidity", value)
    }

    fn voc(&mut self, ts: u64, value: f32) -> Result<(), SinkError> {
        self.append(ts, "voc", format_args!("{:.6}", value))
    }

    fn stop(mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        info!("Closed {}", self.path.display());
        Ok(())
    }
}
