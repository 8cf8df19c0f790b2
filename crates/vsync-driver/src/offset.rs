//! Clock offset acquisition
//!
//! The acquirer turns readings of an external time-sync source (a PTP
//! servo, a vblank timestamp exchange) into [`ClockOffsetSample`]s for the
//! control loop. "Not synchronized" is always an error, never a zero
//! offset: a zero would make the loop declare lock on a free-running clock.

use crate::error::{Result, VsyncError};
use std::fmt::Debug;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

/// One reading reported by a time-sync source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncReading {
    /// Local minus reference time, in nanoseconds
    pub offset_ns: i64,
    /// Frequency error of the local clock if the source estimates it
    pub drift_ppm: Option<f64>,
    /// Whether the source considers itself synchronized
    pub synchronized: bool,
    /// Local timestamp of the measurement
    pub local_time_ns: i64,
    /// Reference timestamp of the measurement
    pub reference_time_ns: i64,
    /// When the reading was taken
    pub sampled_at: Instant,
}

impl SyncReading {
    /// Synchronized reading taken now, with timestamps derived from the
    /// offset
    #[must_use]
    pub fn locked(offset_ns: i64, reference_time_ns: i64) -> Self {
        Self {
            offset_ns,
            drift_ppm: None,
            synchronized: true,
            local_time_ns: reference_time_ns.saturating_add(offset_ns),
            reference_time_ns,
            sampled_at: Instant::now(),
        }
    }

    /// Reading from a source that has not synchronized yet
    #[must_use]
    pub fn unsynchronized() -> Self {
        Self {
            offset_ns: 0,
            drift_ppm: None,
            synchronized: false,
            local_time_ns: 0,
            reference_time_ns: 0,
            sampled_at: Instant::now(),
        }
    }

    /// Attach a drift estimate
    #[must_use]
    pub const fn with_drift(mut self, drift_ppm: f64) -> Self {
        self.drift_ppm = Some(drift_ppm);
        self
    }
}

/// A provider of offset readings
pub trait TimeSyncSource: Debug + Send {
    /// Wait at most `timeout` for the latest reading
    ///
    /// # Errors
    ///
    /// Returns `NoSync` if no reading arrives in time or the source is gone.
    fn query(&mut self, timeout: Duration) -> Result<SyncReading>;
}

impl<S: TimeSyncSource + ?Sized> TimeSyncSource for Box<S> {
    fn query(&mut self, timeout: Duration) -> Result<SyncReading> {
        (**self).query(timeout)
    }
}

/// A validated offset measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockOffsetSample {
    /// Local timestamp
    pub local_time_ns: i64,
    /// Reference timestamp
    pub reference_time_ns: i64,
    /// Local minus reference, in nanoseconds
    pub offset_ns: i64,
    /// Estimated frequency error of the local clock
    pub drift_ppm: f64,
    /// When the reading was taken
    pub taken_at: Instant,
}

/// Query bounds for the acquirer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquirerConfig {
    /// Longest wait for one reading
    pub query_timeout: Duration,
    /// Readings older than this are treated as no sync
    pub max_age: Duration,
}

impl Default for AcquirerConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_millis(500),
            max_age: Duration::from_secs(2),
        }
    }
}

impl AcquirerConfig {
    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for zero durations.
    pub fn validate(&self) -> Result<()> {
        if self.query_timeout.is_zero() || self.max_age.is_zero() {
            return Err(VsyncError::invalid_config(
                "query_timeout and max_age must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Produces samples from a [`TimeSyncSource`]
#[derive(Debug)]
pub struct OffsetAcquirer<S> {
    source: S,
    config: AcquirerConfig,
    previous: Option<ClockOffsetSample>,
}

impl<S: TimeSyncSource> OffsetAcquirer<S> {
    /// Acquirer over `source`
    pub const fn new(source: S, config: AcquirerConfig) -> Self {
        Self {
            source,
            config,
            previous: None,
        }
    }

    /// Query bounds in use
    pub const fn config(&self) -> &AcquirerConfig {
        &self.config
    }

    /// The underlying source
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Take one sample
    ///
    /// # Errors
    ///
    /// Returns `NoSync` when the source is unsynchronized, times out,
    /// overruns the query timeout or delivers a stale reading. The drift
    /// history is dropped in that case.
    pub fn sample(&mut self) -> Result<ClockOffsetSample> {
        match self.try_sample() {
            Ok(sample) => {
                self.previous = Some(sample);
                Ok(sample)
            }
            Err(e) => {
                self.previous = None;
                Err(e)
            }
        }
    }

    fn try_sample(&mut self) -> Result<ClockOffsetSample> {
        let started = Instant::now();
        let reading = self.source.query(self.config.query_timeout)?;
        let now = Instant::now();

        if now.duration_since(started) > self.config.query_timeout {
            return Err(VsyncError::no_sync(format!(
                "source took {:?}, timeout is {:?}",
                now.duration_since(started),
                self.config.query_timeout
            )));
        }
        if !reading.synchronized {
            return Err(VsyncError::no_sync("source reports unsynchronized"));
        }
        let age = now.saturating_duration_since(reading.sampled_at);
        if age > self.config.max_age {
            return Err(VsyncError::no_sync(format!(
                "reading is {age:?} old, limit is {:?}",
                self.config.max_age
            )));
        }

        let drift_ppm = reading
            .drift_ppm
            .unwrap_or_else(|| self.estimate_drift(&reading));

        Ok(ClockOffsetSample {
            local_time_ns: reading.local_time_ns,
            reference_time_ns: reading.reference_time_ns,
            offset_ns: reading.offset_ns,
            drift_ppm,
            taken_at: reading.sampled_at,
        })
    }

    /// Offset change per reference time since the previous sample, in ppm
    #[allow(clippy::cast_precision_loss)]
    fn estimate_drift(&self, reading: &SyncReading) -> f64 {
        let Some(prev) = self.previous else {
            return 0.0;
        };
        let elapsed = reading.reference_time_ns.saturating_sub(prev.reference_time_ns);
        if elapsed <= 0 {
            return 0.0;
        }
        let change = reading.offset_ns.saturating_sub(prev.offset_ns);
        change as f64 / elapsed as f64 * 1e6
    }
}

/// Sending side of a [`ChannelSource`]
#[derive(Debug, Clone)]
pub struct SyncFeed {
    tx: Sender<SyncReading>,
}

impl SyncFeed {
    /// Hand a reading to the loop; false once the loop is gone
    pub fn push(&self, reading: SyncReading) -> bool {
        self.tx.send(reading).is_ok()
    }
}

/// Source fed by another thread
///
/// A query waits for the first reading and then drains whatever else is
/// queued, keeping only the newest.
#[derive(Debug)]
pub struct ChannelSource {
    rx: Receiver<SyncReading>,
}

impl ChannelSource {
    /// Create a connected feed and source
    #[must_use]
    pub fn pair() -> (SyncFeed, Self) {
        let (tx, rx) = mpsc::channel();
        (SyncFeed { tx }, Self { rx })
    }
}

impl TimeSyncSource for ChannelSource {
    fn query(&mut self, timeout: Duration) -> Result<SyncReading> {
        let mut latest = match self.rx.recv_timeout(timeout) {
            Ok(reading) => reading,
            Err(RecvTimeoutError::Timeout) => {
                return Err(VsyncError::no_sync(format!("no reading within {timeout:?}")));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(VsyncError::no_sync("sync feed closed"));
            }
        };
        loop {
            match self.rx.try_recv() {
                Ok(reading) => latest = reading,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquirer() -> (SyncFeed, OffsetAcquirer<ChannelSource>) {
        let (feed, source) = ChannelSource::pair();
        let config = AcquirerConfig {
            query_timeout: Duration::from_millis(20),
            max_age: Duration::from_secs(1),
        };
        (feed, OffsetAcquirer::new(source, config))
    }

    #[test]
    fn unsynchronized_source_is_no_sync() {
        let (feed, mut acq) = acquirer();
        feed.push(SyncReading::unsynchronized());
        assert!(matches!(acq.sample(), Err(VsyncError::NoSync { .. })));
    }

    #[test]
    fn timeout_is_no_sync() {
        let (_feed, mut acq) = acquirer();
        assert!(matches!(acq.sample(), Err(VsyncError::NoSync { .. })));
    }

    #[test]
    fn closed_feed_is_no_sync() {
        let (feed, mut acq) = acquirer();
        drop(feed);
        assert!(matches!(acq.sample(), Err(VsyncError::NoSync { .. })));
    }

    #[test]
    fn stale_reading_is_no_sync() {
        let (feed, mut acq) = acquirer();
        let mut reading = SyncReading::locked(1_000, 0);
        let Some(old) = Instant::now().checked_sub(Duration::from_secs(5)) else {
            return;
        };
        reading.sampled_at = old;
        feed.push(reading);
        assert!(matches!(acq.sample(), Err(VsyncError::NoSync { .. })));
    }

    #[test]
    fn newest_queued_reading_wins() {
        let (feed, mut acq) = acquirer();
        feed.push(SyncReading::locked(5_000, 0));
        feed.push(SyncReading::locked(3_000, 1_000_000));
        let s = acq.sample().unwrap();
        assert_eq!(s.offset_ns, 3_000);
        assert_eq!(s.local_time_ns, 1_003_000);
    }

    #[test]
    fn drift_is_estimated_from_previous_sample() {
        let (feed, mut acq) = acquirer();
        feed.push(SyncReading::locked(1_000, 0));
        assert_eq!(acq.sample().unwrap().drift_ppm, 0.0);

        // 2 µs more offset over one second of reference time
        feed.push(SyncReading::locked(3_000, 1_000_000_000));
        let s = acq.sample().unwrap();
        assert!((s.drift_ppm - 2.0).abs() < 1e-9);

        feed.push(SyncReading::locked(3_000, 2_000_000_000).with_drift(-7.5));
        assert_eq!(acq.sample().unwrap().drift_ppm, -7.5);
    }

    #[test]
    fn sync_loss_resets_drift_history() {
        let (feed, mut acq) = acquirer();
        feed.push(SyncReading::locked(1_000, 0));
        acq.sample().unwrap();
        feed.push(SyncReading::unsynchronized());
        assert!(acq.sample().is_err());
        feed.push(SyncReading::locked(90_000, 1_000_000_000));
        assert_eq!(acq.sample().unwrap().drift_ppm, 0.0);
    }
}
