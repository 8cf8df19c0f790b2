//! Genlock control loop
//!
//! ```text
//!            NoSync / device error (from any state)
//!   ┌──────────────────────────────────────────────┐
//!   ▼                                              │
//! Unsynced ──sample──► Acquiring ──► Converging ◄──┴──► Locked
//!                                   N good samples ──►
//!                                   ◄── |error| > tolerance
//! ```
//!
//! Every cycle advances in-flight retunes, takes one offset sample, runs a
//! PI controller (error in µs, output in ppm) and retunes every enabled PHY
//! to `nominal * (1 + ppm)`. Corrections are absolute, so a cycle deferred
//! by `OperationPending` is simply superseded by the next one.
//!
//! One loop owns one device. Other threads observe it through a
//! [`LoopMonitor`], which reads cloned snapshots.

use crate::codec::DklCodec;
use crate::device::DeviceHandle;
use crate::error::{Result, VsyncError};
use crate::offset::{ClockOffsetSample, OffsetAcquirer, TimeSyncSource};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Controller tuning and loop policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerConfig {
    /// Proportional gain, ppm per µs of error
    pub kp: f64,
    /// Integral gain, ppm per µs·s of accumulated error
    pub ki: f64,
    /// Largest correction applied, in ppm
    pub max_correction_ppm: f64,
    /// Smallest change worth writing while locked, in ppm
    pub deadband_ppm: f64,
    /// Offset error still counted as good
    pub tolerance_ns: i64,
    /// Offset the loop steers to
    pub target_offset_ns: i64,
    /// Consecutive good samples needed to lock
    pub lock_samples: u32,
    /// Device failures tolerated in a row before giving up
    pub max_device_retries: u32,
    /// Cycle period
    pub period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kp: 0.5,
            ki: 0.05,
            max_correction_ppm: 1000.0,
            deadband_ppm: 1.0,
            tolerance_ns: 10_000,
            target_offset_ns: 0,
            lock_samples: 5,
            max_device_retries: 3,
            period: Duration::from_secs(1),
        }
    }
}

impl ControllerConfig {
    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        let bad = |what: &str| Err(VsyncError::invalid_config(what.to_string()));
        if !(self.kp.is_finite() && self.kp >= 0.0) {
            return bad("kp must be finite and >= 0");
        }
        if !(self.ki.is_finite() && self.ki >= 0.0) {
            return bad("ki must be finite and >= 0");
        }
        if !(self.max_correction_ppm.is_finite() && self.max_correction_ppm > 0.0) {
            return bad("max_correction_ppm must be > 0");
        }
        if !(self.deadband_ppm.is_finite() && self.deadband_ppm >= 0.0) {
            return bad("deadband_ppm must be >= 0");
        }
        if self.tolerance_ns < 0 {
            return bad("tolerance_ns must be >= 0");
        }
        if self.lock_samples == 0 {
            return bad("lock_samples must be >= 1");
        }
        if self.period.is_zero() {
            return bad("period must be non-zero");
        }
        Ok(())
    }

    /// Integrator bound: the integral term alone never exceeds the
    /// correction limit
    fn integral_limit(&self) -> f64 {
        if self.ki > 0.0 {
            self.max_correction_ppm / self.ki
        } else {
            0.0
        }
    }
}

/// Loop state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopState {
    /// No usable offset
    #[default]
    Unsynced,
    /// First sample after (re)gaining sync; nominal frequencies captured
    Acquiring,
    /// Correcting, not yet within tolerance long enough
    Converging,
    /// Within tolerance for `lock_samples` consecutive samples
    Locked,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unsynced => "unsynced",
            Self::Acquiring => "acquiring",
            Self::Converging => "converging",
            Self::Locked => "locked",
        };
        f.pad(s)
    }
}

/// Working state of the loop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlState {
    /// Current state
    pub state: LoopState,
    /// Offset the loop steers to
    pub target_offset_ns: i64,
    /// Offset of the last good sample
    pub last_offset_ns: Option<i64>,
    /// Drift of the last good sample
    pub last_drift_ppm: Option<f64>,
    /// Controller output of the last cycle
    pub correction_ppm: f64,
    /// Correction currently programmed
    pub applied_ppm: f64,
    /// Offset error still counted as good
    pub tolerance_ns: i64,
    /// Consecutive in-tolerance samples
    pub good_samples: u32,
    /// Integrated error, µs·s
    pub integral: f64,
    /// Consecutive device failures
    pub device_failures: u32,
    /// Cycles run
    pub cycles: u64,
}

/// What one cycle did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleOutcome {
    /// No usable sample; nothing written
    NoSync,
    /// Correction programmed on every enabled PHY
    Applied {
        /// Correction in ppm
        correction_ppm: f64,
    },
    /// Locked and the change is inside the deadband, or no PHY is
    /// enabled; nothing written
    Held {
        /// Computed correction in ppm
        correction_ppm: f64,
    },
    /// A PHY still had a retune in flight; retried next cycle
    Deferred {
        /// First PHY that was busy
        phy: usize,
    },
    /// The device failed and was closed; it is remapped next cycle
    DeviceError,
}

/// Copy of the loop state for other threads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlSnapshot {
    /// Controller state
    pub control: ControlState,
    /// PHYs being steered and their nominal frequency in MHz
    pub phys: Vec<(usize, f64)>,
}

/// Read-only view of a running loop
#[derive(Debug, Clone)]
pub struct LoopMonitor {
    shared: Arc<RwLock<ControlSnapshot>>,
}

impl LoopMonitor {
    /// Latest published snapshot
    #[must_use]
    pub fn snapshot(&self) -> ControlSnapshot {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest published state
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .control
            .state
    }
}

/// Closed-loop PLL controller for one device
#[derive(Debug)]
pub struct GenlockLoop<S> {
    device: DeviceHandle,
    codec: DklCodec,
    acquirer: OffsetAcquirer<S>,
    config: ControllerConfig,
    control: ControlState,
    nominal: Vec<(usize, f64)>,
    shared: Arc<RwLock<ControlSnapshot>>,
    lost: bool,
}

impl<S: TimeSyncSource> GenlockLoop<S> {
    /// Create a loop; the device is mapped on the first cycle if needed
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn new(
        device: DeviceHandle,
        codec: DklCodec,
        acquirer: OffsetAcquirer<S>,
        config: ControllerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let control = ControlState {
            target_offset_ns: config.target_offset_ns,
            tolerance_ns: config.tolerance_ns,
            ..ControlState::default()
        };
        let shared = Arc::new(RwLock::new(ControlSnapshot {
            control: control.clone(),
            phys: Vec::new(),
        }));
        Ok(Self {
            device,
            codec,
            acquirer,
            config,
            control,
            nominal: Vec::new(),
            shared,
            lost: false,
        })
    }

    /// Working state
    pub const fn control(&self) -> &ControlState {
        &self.control
    }

    /// Current state
    pub const fn state(&self) -> LoopState {
        self.control.state
    }

    /// Tuning in use
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Device being steered
    pub const fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Codec state
    pub const fn codec(&self) -> &DklCodec {
        &self.codec
    }

    /// PHYs being steered and their nominal frequency in MHz
    pub fn nominal_frequencies(&self) -> &[(usize, f64)] {
        &self.nominal
    }

    /// A monitor for other threads
    pub fn monitor(&self) -> LoopMonitor {
        LoopMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Give the device back
    pub fn into_device(self) -> DeviceHandle {
        self.device
    }

    /// Run one control cycle at `now`
    ///
    /// # Errors
    ///
    /// - `DeviceLost` once device failures exceed `max_device_retries`;
    ///   every later call returns it too
    /// - programming errors (`InvalidIndex`, `ValueOutOfRange`,
    ///   `InvalidDividers`, ...) unchanged
    pub fn run_cycle(&mut self, now: Instant) -> Result<CycleOutcome> {
        if self.lost {
            return Err(VsyncError::DeviceLost {
                attempts: self.control.device_failures,
            });
        }
        self.control.cycles += 1;

        let result = match self.cycle(now) {
            Err(e) if e.is_device_failure() => self.device_failed(&e),
            other => other,
        };
        self.publish();
        result
    }

    fn cycle(&mut self, now: Instant) -> Result<CycleOutcome> {
        if !self.device.is_mapped() {
            self.device.map()?;
            info!("Remapped {}", self.device.info().address);
        }
        self.codec.advance(&mut self.device, now)?;

        let sample = match self.acquirer.sample() {
            Ok(sample) => sample,
            Err(VsyncError::NoSync { reason }) => {
                self.lose_sync(&reason);
                return Ok(CycleOutcome::NoSync);
            }
            Err(e) => return Err(e),
        };

        let entering = self.control.state == LoopState::Unsynced;
        if entering {
            self.acquire()?;
            self.control.good_samples = 0;
            self.transition(LoopState::Acquiring);
        }

        let within = self.observe(&sample);
        // Acquiring lasts one cycle.
        if !entering {
            let locked = self.control.good_samples >= self.config.lock_samples;
            match self.control.state {
                LoopState::Acquiring | LoopState::Converging if locked => {
                    self.transition(LoopState::Locked);
                }
                LoopState::Acquiring => self.transition(LoopState::Converging),
                LoopState::Locked if !within => self.transition(LoopState::Converging),
                _ => {}
            }
        }

        let correction = self.update_controller(&sample);

        if self.control.state == LoopState::Locked
            && (correction - self.control.applied_ppm).abs() <= self.config.deadband_ppm
        {
            debug!("Holding {:.3} ppm (computed {correction:.3})", self.control.applied_ppm);
            return Ok(CycleOutcome::Held {
                correction_ppm: correction,
            });
        }

        self.apply(correction, now)
    }

    /// Record a sample; returns whether it is within tolerance
    fn observe(&mut self, sample: &ClockOffsetSample) -> bool {
        let error = sample.offset_ns.saturating_sub(self.control.target_offset_ns);
        let within = error.unsigned_abs() <= self.control.tolerance_ns.unsigned_abs();
        self.control.good_samples = if within {
            self.control.good_samples.saturating_add(1)
        } else {
            0
        };
        self.control.last_offset_ns = Some(sample.offset_ns);
        self.control.last_drift_ppm = Some(sample.drift_ppm);
        debug!(
            offset_ns = sample.offset_ns,
            drift_ppm = sample.drift_ppm,
            good = self.control.good_samples,
            "sample"
        );
        within
    }

    /// PI step; positive offset lowers the frequency
    #[allow(clippy::cast_precision_loss)]
    fn update_controller(&mut self, sample: &ClockOffsetSample) -> f64 {
        let error_us =
            sample.offset_ns.saturating_sub(self.control.target_offset_ns) as f64 / 1_000.0;
        let dt = self.config.period.as_secs_f64();
        let limit = self.config.integral_limit();

        self.control.integral = (self.control.integral + error_us * dt).clamp(-limit, limit);
        let raw = -(self.config.kp * error_us + self.config.ki * self.control.integral);
        let max = self.config.max_correction_ppm;
        self.control.correction_ppm = raw.clamp(-max, max);
        self.control.correction_ppm
    }

    fn apply(&mut self, correction_ppm: f64, now: Instant) -> Result<CycleOutcome> {
        if self.nominal.is_empty() {
            debug!("No PHY to steer, holding {correction_ppm:.3} ppm");
            return Ok(CycleOutcome::Held { correction_ppm });
        }
        let mut busy = None;
        for &(phy, nominal) in &self.nominal {
            let target = nominal * (1.0 + correction_ppm * 1e-6);
            match self.codec.select(&mut self.device, phy)?.retune(target, now) {
                Ok(_) => {}
                Err(VsyncError::OperationPending { phy }) => {
                    busy.get_or_insert(phy);
                }
                Err(e) => return Err(e),
            }
        }
        self.control.device_failures = 0;

        if let Some(phy) = busy {
            warn!("PHY {phy} busy, deferring {correction_ppm:.3} ppm");
            return Ok(CycleOutcome::Deferred { phy });
        }
        self.control.applied_ppm = correction_ppm;
        debug!("Applied {correction_ppm:.3} ppm to {} PHY(s)", self.nominal.len());
        Ok(CycleOutcome::Applied { correction_ppm })
    }

    /// Probe PHYs and capture their nominal frequency
    fn acquire(&mut self) -> Result<()> {
        let phys = self.codec.find_enabled_phys(&mut self.device)?;
        if phys.is_empty() {
            warn!("No enabled DKL PHYs; corrections have nowhere to go");
        }
        let mut nominal = Vec::with_capacity(phys.len());
        for phy in phys {
            let mhz = self.codec.select(&mut self.device, phy)?.nominal_frequency_mhz()?;
            info!("PHY {phy} nominal {mhz:.6} MHz");
            nominal.push((phy, mhz));
        }
        self.nominal = nominal;
        self.control.device_failures = 0;
        Ok(())
    }

    fn lose_sync(&mut self, reason: &str) {
        if self.control.state != LoopState::Unsynced {
            warn!("Sync lost: {reason}");
        } else {
            debug!("Still unsynced: {reason}");
        }
        self.control.good_samples = 0;
        self.transition(LoopState::Unsynced);
    }

    fn device_failed(&mut self, err: &VsyncError) -> Result<CycleOutcome> {
        self.control.device_failures = self.control.device_failures.saturating_add(1);
        let attempts = self.control.device_failures;
        self.control.good_samples = 0;
        self.transition(LoopState::Unsynced);
        self.device.close();

        if attempts > self.config.max_device_retries {
            error!("Device {} lost: {err}", self.device.info().address);
            self.lost = true;
            return Err(VsyncError::DeviceLost { attempts });
        }
        warn!(
            "Device error ({attempts}/{}): {err}; remapping next cycle",
            self.config.max_device_retries
        );
        Ok(CycleOutcome::DeviceError)
    }

    fn transition(&mut self, next: LoopState) {
        if self.control.state != next {
            info!("Genlock {} -> {next}", self.control.state);
            self.control.state = next;
        }
    }

    fn publish(&self) {
        let snapshot = ControlSnapshot {
            control: self.control.clone(),
            phys: self.nominal.clone(),
        };
        *self.shared.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Restore the original registers of every retuned PHY
    ///
    /// # Errors
    ///
    /// Returns a device error if the registers cannot be reached.
    pub fn shutdown(&mut self) -> Result<usize> {
        if !self.device.is_mapped() {
            self.device.map()?;
        }
        let restored = self.codec.restore_all(&mut self.device)?;
        info!("Restored {restored} PHY(s)");
        Ok(restored)
    }

    /// Drive cycles every `period` until `stop` is set or a fatal error
    ///
    /// Original registers are restored on the way out.
    ///
    /// # Errors
    ///
    /// Returns the fatal cycle error, or the restore error after a clean
    /// stop.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        info!(
            "Genlock loop started on {} (period {:?})",
            self.device.info().address,
            self.config.period
        );
        let result = loop {
            if stop.load(Ordering::Relaxed) {
                break Ok(());
            }
            let started = Instant::now();
            if let Err(e) = self.run_cycle(started) {
                break Err(e);
            }
            self.idle_until(started + self.config.period, stop);
        };

        let restored = if self.lost { Ok(0) } else { self.shutdown() };
        info!("Genlock loop stopped");
        match (result, restored) {
            (Err(e), _) => Err(e),
            (Ok(()), r) => r.map(|_| ()),
        }
    }

    /// Sleep until `deadline`, writing retune steps as they fall due
    fn idle_until(&mut self, deadline: Instant, stop: &AtomicBool) {
        let slice = self
            .codec
            .retune_config()
            .step_interval
            .clamp(Duration::from_millis(1), Duration::from_millis(10));
        loop {
            let now = Instant::now();
            if now >= deadline || stop.load(Ordering::Relaxed) {
                return;
            }
            if !self.codec.all_done() && self.device.is_mapped() {
                if let Err(e) = self.codec.advance(&mut self.device, now) {
                    // The next cycle advances again and handles the error.
                    warn!("Retune step failed between cycles: {e}");
                }
            }
            thread::sleep((deadline - now).min(slice));
        }
    }
}

impl<S: TimeSyncSource + 'static> GenlockLoop<S> {
    /// Run the loop on its own thread
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn(mut self, stop: Arc<AtomicBool>) -> Result<JoinHandle<Result<()>>> {
        let name = format!("genlock-{}", self.device.info().address);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || self.run(&stop))?;
        Ok(handle)
    }
}
