//! Vblank phase estimation
//!
//! When two systems exchange vblank timestamps over a network (with their
//! clocks already aligned by PTP) the useful quantity is not the raw
//! timestamp difference but the distance to the nearest reference vblank.
//! The reference refresh period is estimated from the train of timestamps
//! the reference sent, and the raw difference is folded into one period.

use crate::offset::SyncReading;
use std::time::Instant;

/// Mean spacing of a timestamp train, in the train's unit
///
/// Returns `None` for fewer than two timestamps or a non-increasing train.
#[must_use]
pub fn average_period(timestamps: &[i64]) -> Option<i64> {
    let (first, last) = (timestamps.first()?, timestamps.last()?);
    let intervals = i64::try_from(timestamps.len().checked_sub(1)?).ok()?;
    if intervals == 0 {
        return None;
    }
    let period = last.checked_sub(*first)? / intervals;
    (period > 0).then_some(period)
}

/// Phase of a local vblank relative to a reference train
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseOffset {
    /// Raw difference to the last reference vblank
    pub raw: i64,
    /// Difference to the nearest reference vblank, in `(-period/2, period/2]`
    pub offset: i64,
    /// Estimated reference period
    pub period: i64,
}

/// Fold the distance from the last reference vblank to `local` into one
/// reference period
///
/// Returns `None` if no period can be estimated from `reference`.
#[must_use]
pub fn phase_offset(reference: &[i64], local: i64) -> Option<PhaseOffset> {
    let period = average_period(reference)?;
    let raw = local.checked_sub(*reference.last()?)?;
    let mut offset = raw.rem_euclid(period);
    if offset > period / 2 {
        offset -= period;
    }
    Some(PhaseOffset {
        raw,
        offset,
        period,
    })
}

/// Vblank timestamps exchanged with a reference system, in microseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VblankReport {
    /// Recent vblank timestamps of the reference, oldest first
    pub reference_us: Vec<i64>,
    /// Local vblank timestamp
    pub local_us: i64,
}

impl VblankReport {
    /// Convert into a sync reading taken at `sampled_at`
    ///
    /// The reading is marked unsynchronized when the reference train is too
    /// short to estimate a period, so the loop sees `NoSync` instead of a
    /// made-up offset.
    #[must_use]
    pub fn into_reading(self, sampled_at: Instant) -> SyncReading {
        match phase_offset(&self.reference_us, self.local_us) {
            Some(phase) => {
                let offset_ns = phase.offset.saturating_mul(1_000);
                let local_time_ns = self.local_us.saturating_mul(1_000);
                SyncReading {
                    offset_ns,
                    drift_ppm: None,
                    synchronized: true,
                    local_time_ns,
                    reference_time_ns: local_time_ns.saturating_sub(offset_ns),
                    sampled_at,
                }
            }
            None => SyncReading {
                sampled_at,
                ..SyncReading::unsynchronized()
            },
        }
    }
}
