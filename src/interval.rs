//! Interval aggregation of bursty sensor samples.
//!
//! Every window is keyed by (device, label, format). Samples fold into a rolling
//! average while the window runs; once its period has elapsed, the next
//! [`Intervals::record`] call flushes the average to the bound callback. There
//! is no timer: a window with no new samples never flushes, and periods that
//! pass without samples are not replayed.

use log::{debug, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

use crate::error::IntervalError;
use crate::models::DeviceId;
use crate::utils::unix_millis;

/// Numeric representation a window aggregates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Format {
    /// Unsigned integer, averaged with integer division
    Ulong,
    /// Single-precision float
    Float,
}

impl Format {
    /// Parse a printf-style format tag (`%lu` or `%f`).
    pub fn parse(tag: &str) -> Result<Self, IntervalError> {
        match tag {
            "%lu" => Ok(Format::Ulong),
            "%f" => Ok(Format::Float),
            other => Err(IntervalError::UnsupportedFormat(other.to_string())),
        }
    }

    fn zero(self) -> Value {
        match self {
            Format::Ulong => Value::Ulong(0),
            Format::Float => Value::Float(0.0),
        }
    }
}

/// A sample or an aggregated value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Ulong(u64),
    Float(f32),
}

impl Value {
    pub fn format(&self) -> Format {
        match self {
            Value::Ulong(_) => Format::Ulong,
            Value::Float(_) => Format::Float,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Ulong(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:.6}", v),
        }
    }
}

/// Identifies one aggregation window
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalKey {
    pub device: DeviceId,
    pub label: String,
    pub format: Format,
}

impl IntervalKey {
    pub fn new(device: DeviceId, label: impl Into<String>, format: Format) -> Self {
        IntervalKey {
            device,
            label: label.into(),
            format,
        }
    }
}

impl fmt::Display for IntervalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.label)
    }
}

/// Receives `(timestamp_ms, average)` when a window flushes
pub type FlushCallback = Box<dyn FnMut(u64, Value) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Stopped,
    Running,
}

/// What [`Intervals::record`] did with a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// The window is not running
    Ignored,
    Accumulated,
    /// The period elapsed and the average was flushed
    Flushed,
}

/// Source of monotonic and wall-clock time in milliseconds
pub trait Clock: Send + Sync {
    fn monotonic_ms(&self) -> u64;
    fn timestamp_ms(&self) -> u64;
}

#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn timestamp_ms(&self) -> u64 {
        unix_millis(OffsetDateTime::now_utc())
    }
}

/// Clock advanced by hand; both time sources report the same value.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        ManualClock {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn monotonic_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn timestamp_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

struct Window {
    state: WindowState,
    period_ms: u64,
    average: Value,
    samples: u64,
    deadline_ms: u64,
    callback: Option<FlushCallback>,
}

/// Snapshot of a window for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct WindowInfo {
    pub key: IntervalKey,
    pub state: WindowState,
    pub period_ms: u64,
    pub average: Value,
    pub samples: u64,
    pub deadline_ms: u64,
    pub has_callback: bool,
}

/// `avg - avg/n + sample/n`, evaluated in the window's own number type.
///
/// For integer windows this drifts from the arithmetic mean because every
/// division truncates.
fn rolling_average(average: Value, sample: Value, n: u64) -> Value {
    match (average, sample) {
        (Value::Ulong(avg), Value::Ulong(s)) => {
            Value::Ulong((avg - avg / n).saturating_add(s / n))
        }
        (Value::Float(avg), Value::Float(s)) => {
            let n = n as f32;
            Value::Float(avg - avg / n + s / n)
        }
        // formats are checked before folding
        (avg, _) => avg,
    }
}

/// Registry of aggregation windows
pub struct Intervals {
    windows: BTreeMap<IntervalKey, Window>,
    clock: Arc<dyn Clock>,
}

impl Default for Intervals {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Intervals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intervals")
            .field("windows", &self.windows.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Intervals {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Intervals {
            windows: BTreeMap::new(),
            clock,
        }
    }

    /// Define a stopped window with a zero accumulator.
    pub fn add(&mut self, key: IntervalKey) -> Result<(), IntervalError> {
        if self.windows.contains_key(&key) {
            return Err(IntervalError::AlreadyExists(key));
        }
        debug!("Interval {} added ({:?})", key, key.format);
        let average = key.format.zero();
        self.windows.insert(
            key,
            Window {
                state: WindowState::Stopped,
                period_ms: 0,
                average,
                samples: 0,
                deadline_ms: 0,
                callback: None,
            },
        );
        Ok(())
    }

    /// Attach the flush callback, replacing any previous one.
    pub fn bind_callback(
        &mut self,
        key: &IntervalKey,
        callback: FlushCallback,
    ) -> Result<(), IntervalError> {
        let window = self.window_mut(key)?;
        window.callback = Some(callback);
        Ok(())
    }

    /// Detach and return the flush callback, if any.
    pub fn unbind_callback(
        &mut self,
        key: &IntervalKey,
    ) -> Result<Option<FlushCallback>, IntervalError> {
        Ok(self.window_mut(key)?.callback.take())
    }

    pub fn start(&mut self, key: &IntervalKey, period_ms: u64) -> Result<(), IntervalError> {
        if period_ms == 0 {
            return Err(IntervalError::ZeroPeriod(key.clone()));
        }
        let now = self.clock.monotonic_ms();
        let window = self.window_mut(key)?;
        window.state = WindowState::Running;
        window.period_ms = period_ms;
        window.average = key.format.zero();
        window.samples = 0;
        window.deadline_ms = now.saturating_add(period_ms);
        debug!("Interval {} started ({} ms)", key, period_ms);
        Ok(())
    }

    /// Fold a sample into the window, flushing if its period has elapsed.
    pub fn record(&mut self, key: &IntervalKey, sample: Value) -> Result<Recorded, IntervalError> {
        let clock = Arc::clone(&self.clock);
        let window = self.window_mut(key)?;

        if window.state != WindowState::Running {
            debug!("Interval {} not running, sample {} ignored", key, sample);
            return Ok(Recorded::Ignored);
        }
        if sample.format() != key.format {
            return Err(IntervalError::FormatMismatch {
                key: key.clone(),
                expected: key.format,
            });
        }

        window.samples += 1;
        window.average = rolling_average(window.average, sample, window.samples);

        let now = clock.monotonic_ms();
        if now < window.deadline_ms {
            return Ok(Recorded::Accumulated);
        }

        let ts = clock.timestamp_ms();
        debug!(
            "Interval {} flushing {} after {} sample(s)",
            key, window.average, window.samples
        );
        match window.callback.as_mut() {
            Some(callback) => callback(ts, window.average),
            None => warn!("Interval {} elapsed without a callback", key),
        }
        window.samples = 0;
        window.deadline_ms = now.saturating_add(window.period_ms);
        Ok(Recorded::Flushed)
    }

    /// Stop accumulating; the last average is kept until removal.
    pub fn stop(&mut self, key: &IntervalKey) -> Result<(), IntervalError> {
        let window = self.window_mut(key)?;
        window.state = WindowState::Stopped;
        window.period_ms = 0;
        window.deadline_ms = 0;
        debug!("Interval {} stopped", key);
        Ok(())
    }

    /// Delete the window together with its callback.
    pub fn remove(&mut self, key: &IntervalKey) -> Result<(), IntervalError> {
        match self.windows.remove(key) {
            Some(_) => {
                debug!("Interval {} removed", key);
                Ok(())
            }
            None => Err(IntervalError::NotFound(key.clone())),
        }
    }

    pub fn state(&self, key: &IntervalKey) -> Option<WindowState> {
        self.windows.get(key).map(|w| w.state)
    }

    pub fn contains(&self, key: &IntervalKey) -> bool {
        self.windows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Snapshot every window in key order and log it at debug level.
    pub fn dump(&self) -> Vec<WindowInfo> {
        self.windows
            .iter()
            .map(|(key, w)| {
                debug!(
                    "Interval {}: {:?}, period {} ms, average {}, {} sample(s), callback: {}",
                    key,
                    w.state,
                    w.period_ms,
                    w.average,
                    w.samples,
                    w.callback.is_some()
                );
                WindowInfo {
                    key: key.clone(),
                    state: w.state,
                    period_ms: w.period_ms,
                    average: w.average,
                    samples: w.samples,
                    deadline_ms: w.deadline_ms,
                    has_callback: w.callback.is_some(),
                }
            })
            .collect()
    }

    fn window_mut(&mut self, key: &IntervalKey) -> Result<&mut Window, IntervalError> {
        self.windows
            .get_mut(key)
            .ok_or_else(|| IntervalError::NotFound(key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Flushes = Arc<Mutex<Vec<(u64, Value)>>>;

    fn engine() -> (Arc<ManualClock>, Intervals) {
        let clock = Arc::new(ManualClock::new(0));
        let intervals = Intervals::with_clock(clock.clone());
        (clock, intervals)
    }

    fn collector() -> (Flushes, FlushCallback) {
        let flushes: Flushes = Arc::default();
        let sink = Arc::clone(&flushes);
        let callback: FlushCallback = Box::new(move |ts, value| {
            sink.lock().unwrap().push((ts, value));
        });
        (flushes, callback)
    }

    fn running(intervals: &mut Intervals, key: &IntervalKey, period: u64) -> Flushes {
        let (flushes, callback) = collector();
        intervals.add(key.clone()).unwrap();
        intervals.bind_callback(key, callback).unwrap();
        intervals.start(key, period).unwrap();
        flushes
    }

    #[test]
    fn parses_supported_formats_only() {
        assert_eq!(Format::parse("%lu").unwrap(), Format::Ulong);
        assert_eq!(Format::parse("%f").unwrap(), Format::Float);
        assert_eq!(
            Format::parse("%s"),
            Err(IntervalError::UnsupportedFormat("%s".into()))
        );
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let (_clock, mut intervals) = engine();
        let key = IntervalKey::new(0, "voc", Format::Float);
        intervals.add(key.clone()).unwrap();
        assert_eq!(
            intervals.add(key.clone()),
            Err(IntervalError::AlreadyExists(key))
        );

        // same label with another format is a different window
        intervals.add(IntervalKey::new(0, "voc", Format::Ulong)).unwrap();
        assert_eq!(intervals.len(), 2);
    }

    #[test]
    fn operations_on_missing_key_fail() {
        let (_clock, mut intervals) = engine();
        let key = IntervalKey::new(3, "humidity", Format::Ulong);
        let (_, callback) = collector();

        assert!(matches!(
            intervals.bind_callback(&key, callback),
            Err(IntervalError::NotFound(_))
        ));
        assert!(matches!(intervals.start(&key, 100), Err(IntervalError::NotFound(_))));
        assert!(matches!(
            intervals.record(&key, Value::Ulong(1)),
            Err(IntervalError::NotFound(_))
        ));
        assert!(matches!(intervals.stop(&key), Err(IntervalError::NotFound(_))));
        assert!(matches!(intervals.remove(&key), Err(IntervalError::NotFound(_))));
    }

    #[test]
    fn unstarted_window_ignores_samples() {
        let (clock, mut intervals) = engine();
        let key = IntervalKey::new(0, "temperature", Format::Ulong);
        let (flushes, callback) = collector();
        intervals.add(key.clone()).unwrap();
        intervals.bind_callback(&key, callback).unwrap();

        clock.advance(10_000);
        for _ in 0..5 {
            assert_eq!(intervals.record(&key, Value::Ulong(20)).unwrap(), Recorded::Ignored);
        }
        assert!(flushes.lock().unwrap().is_empty());
        assert_eq!(intervals.dump()[0].samples, 0);
    }

    #[test]
    fn flushes_once_per_elapsed_period() {
        let (clock, mut intervals) = engine();
        let key = IntervalKey::new(0, "temperature", Format::Ulong);
        let flushes = running(&mut intervals, &key, 500);

        let mut outcomes = Vec::new();
        for _ in 0..16 {
            clock.advance(100);
            outcomes.push(intervals.record(&key, Value::Ulong(21)).unwrap());
        }

        let flushed: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| **o == Recorded::Flushed)
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(flushed, vec![5, 10, 15]);
        assert_eq!(
            *flushes.lock().unwrap(),
            vec![
                (500, Value::Ulong(21)),
                (1000, Value::Ulong(21)),
                (1500, Value::Ulong(21))
            ]
        );
    }

    #[test]
    fn missed_periods_are_not_replayed() {
        let (clock, mut intervals) = engine();
        let key = IntervalKey::new(0, "voc", Format::Float);
        let flushes = running(&mut intervals, &key, 500);

        clock.advance(5_000);
        assert_eq!(intervals.record(&key, Value::Float(1.0)).unwrap(), Recorded::Flushed);
        clock.advance(100);
        assert_eq!(
            intervals.record(&key, Value::Float(1.0)).unwrap(),
            Recorded::Accumulated
        );
        assert_eq!(flushes.lock().unwrap().len(), 1);
        assert_eq!(intervals.dump()[0].deadline_ms, 5_500);
    }

    #[test]
    fn constant_float_input_reports_the_constant() {
        let (clock, mut intervals) = engine();
        let key = IntervalKey::new(0, "voc", Format::Float);
        let flushes = running(&mut intervals, &key, 1_000);

        for _ in 0..10 {
            clock.advance(100);
            intervals.record(&key, Value::Float(2.5)).unwrap();
        }
        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        match flushes[0].1 {
            Value::Float(v) => assert!((v - 2.5).abs() < 1e-5, "got {}", v),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn integer_average_follows_truncating_recurrence() {
        let (clock, mut intervals) = engine();
        let key = IntervalKey::new(0, "humidity", Format::Ulong);
        let flushes = running(&mut intervals, &key, 300);

        // n=1: 0 - 0 + 1 = 1; n=2: 1 - 0 + 1 = 2; n=3: 2 - 0 + 1 = 3
        // the arithmetic mean of 1, 2, 4 would be 2
        clock.advance(100);
        intervals.record(&key, Value::Ulong(1)).unwrap();
        clock.advance(100);
        intervals.record(&key, Value::Ulong(2)).unwrap();
        clock.advance(100);
        intervals.record(&key, Value::Ulong(4)).unwrap();

        assert_eq!(*flushes.lock().unwrap(), vec![(300, Value::Ulong(3))]);
    }

    #[test]
    fn float_average_matches_recurrence() {
        let samples = [10.0f32, 20.0, 30.0, 45.5];
        let mut expected = 0.0f32;
        for (i, s) in samples.iter().enumerate() {
            let n = (i + 1) as f32;
            expected = expected - expected / n + s / n;
        }

        let (clock, mut intervals) = engine();
        let key = IntervalKey::new(1, "voc", Format::Float);
        let flushes = running(&mut intervals, &key, 400);
        for s in samples {
            clock.advance(100);
            intervals.record(&key, Value::Float(s)).unwrap();
        }
        assert_eq!(flushes.lock().unwrap()[0].1, Value::Float(expected));
    }

    #[test]
    fn sample_count_restarts_after_flush() {
        let (clock, mut intervals) = engine();
        let key = IntervalKey::new(0, "temperature", Format::Ulong);
        let flushes = running(&mut intervals, &key, 200);

        clock.advance(100);
        intervals.record(&key, Value::Ulong(10)).unwrap();
        clock.advance(100);
        intervals.record(&key, Value::Ulong(30)).unwrap();
        // first sample of the next window replaces the old average entirely
        clock.advance(100);
        intervals.record(&key, Value::Ulong(50)).unwrap();
        clock.advance(100);
        intervals.record(&key, Value::Ulong(50)).unwrap();

        assert_eq!(
            *flushes.lock().unwrap(),
            vec![(200, Value::Ulong(20)), (400, Value::Ulong(50))]
        );
    }

    #[test]
    fn keys_are_isolated() {
        let (clock, mut intervals) = engine();
        let first = IntervalKey::new(0, "temperature", Format::Ulong);
        let second = IntervalKey::new(1, "temperature", Format::Ulong);
        let first_flushes = running(&mut intervals, &first, 300);
        let second_flushes = running(&mut intervals, &second, 300);

        for _ in 0..3 {
            clock.advance(100);
            intervals.record(&first, Value::Ulong(20)).unwrap();
            intervals.record(&second, Value::Ulong(30)).unwrap();
        }

        assert_eq!(*first_flushes.lock().unwrap(), vec![(300, Value::Ulong(20))]);
        assert_eq!(*second_flushes.lock().unwrap(), vec![(300, Value::Ulong(30))]);
    }

    #[test]
    fn wrong_sample_type_is_rejected() {
        let (_clock, mut intervals) = engine();
        let key = IntervalKey::new(0, "voc", Format::Float);
        running(&mut intervals, &key, 100);
        assert!(matches!(
            intervals.record(&key, Value::Ulong(1)),
            Err(IntervalError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn zero_period_is_rejected() {
        let (_clock, mut intervals) = engine();
        let key = IntervalKey::new(0, "voc", Format::Float);
        intervals.add(key.clone()).unwrap();
        assert_eq!(intervals.start(&key, 0), Err(IntervalError::ZeroPeriod(key.clone())));
        assert_eq!(intervals.state(&key), Some(WindowState::Stopped));
    }

    #[test]
    fn stop_keeps_average_and_remove_discards_window() {
        let (clock, mut intervals) = engine();
        let key = IntervalKey::new(0, "humidity", Format::Ulong);
        let flushes = running(&mut intervals, &key, 1_000);

        clock.advance(100);
        intervals.record(&key, Value::Ulong(40)).unwrap();
        intervals.stop(&key).unwrap();

        let info = &intervals.dump()[0];
        assert_eq!(info.state, WindowState::Stopped);
        assert_eq!(info.period_ms, 0);
        assert_eq!(info.deadline_ms, 0);
        assert_eq!(info.average, Value::Ulong(40));
        assert!(info.has_callback);

        clock.advance(5_000);
        assert_eq!(intervals.record(&key, Value::Ulong(1)).unwrap(), Recorded::Ignored);

        intervals.remove(&key).unwrap();
        assert!(!intervals.contains(&key));
        assert!(flushes.lock().unwrap().is_empty());
    }

    #[test]
    fn rebinding_replaces_callback() {
        let (clock, mut intervals) = engine();
        let key = IntervalKey::new(0, "temperature", Format::Ulong);
        let old = running(&mut intervals, &key, 100);
        let (new, callback) = collector();
        intervals.bind_callback(&key, callback).unwrap();

        clock.advance(100);
        intervals.record(&key, Value::Ulong(5)).unwrap();
        assert!(old.lock().unwrap().is_empty());
        assert_eq!(new.lock().unwrap().len(), 1);

        assert!(intervals.unbind_callback(&key).unwrap().is_some());
        clock.advance(100);
        assert_eq!(intervals.record(&key, Value::Ulong(5)).unwrap(), Recorded::Flushed);
        assert_eq!(new.lock().unwrap().len(), 1);
    }

    #[test]
    fn dump_lists_windows_in_key_order() {
        let (_clock, mut intervals) = engine();
        intervals.add(IntervalKey::new(1, "voc", Format::Float)).unwrap();
        intervals.add(IntervalKey::new(0, "voc", Format::Float)).unwrap();
        intervals.add(IntervalKey::new(0, "humidity", Format::Ulong)).unwrap();

        let labels: Vec<(DeviceId, String)> = intervals
            .dump()
            .into_iter()
            .map(|info| (info.key.device, info.key.label))
            .collect();
        assert_eq!(
            labels,
            vec![
                (0, "humidity".to_string()),
                (0, "voc".to_string()),
                (1, "voc".to_string())
            ]
        );
    }
}
