/// Formatting and time helpers shared by the binaries and the pipeline
use time::macros::format_description;
use time::OffsetDateTime;

/// Format a timestamp for human-readable logging as DD.MM.YYYY - HH:MM:SS.
///
/// Falls back to the default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = format_description!("[day].[month].[year] - [hour]:[minute]:[second]");
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Milliseconds since the Unix epoch, clamped to zero for earlier instants.
pub fn unix_millis(dt: OffsetDateTime) -> u64 {
    u64::try_from(dt.unix_timestamp_nanos() / 1_000_000).unwrap_or(0)
}

/// Space-separated lowercase hex, used when tracing raw payloads.
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
