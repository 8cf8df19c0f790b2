// SPDX-License-Identifier: AGPL-3.0-only

//! One-shot vblank phase shift
//!
//! Moves the local vblank by a known time difference without a control
//! loop: every enabled PHY runs `shift` percent fast or slow for exactly
//! as long as it takes to accumulate the difference, then returns to its
//! original registers.
//!
//! ```text
//! start ──► Shifting ──(target reached)──► Holding ──(hold elapsed)──►
//!           Returning ──(back at nominal)──► Done
//! ```
//!
//! A positive difference means the local display is ahead, so the PLL is
//! slowed down.

use crate::codec::DklCodec;
use crate::device::DeviceHandle;
use crate::error::{Result, VsyncError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Parameters of a phase shift
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShiftConfig {
    /// Frequency offset in percent, also the stepping granularity
    pub shift_percent: f64,
    /// Larger offset used for big differences (0 disables it)
    pub shift2_percent: f64,
    /// Difference from which `shift2_percent` is used, in µs
    pub step_threshold_us: u64,
    /// Return to the original registers after the hold
    pub reset: bool,
    /// Write registers; when false only the plan is reported
    pub commit: bool,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            shift_percent: 0.1,
            shift2_percent: 0.0,
            step_threshold_us: 1000,
            reset: true,
            commit: true,
        }
    }
}

impl ShiftConfig {
    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a non-positive shift or a negative
    /// secondary shift.
    pub fn validate(&self) -> Result<()> {
        if !(self.shift_percent.is_finite() && self.shift_percent > 0.0) {
            return Err(VsyncError::invalid_config(format!(
                "shift must be > 0, got {}",
                self.shift_percent
            )));
        }
        if !(self.shift2_percent.is_finite() && self.shift2_percent >= 0.0) {
            return Err(VsyncError::invalid_config(format!(
                "shift2 must be >= 0, got {}",
                self.shift2_percent
            )));
        }
        Ok(())
    }
}

/// Which way the PLL is moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftDirection {
    /// Lower frequency: the local vblank falls back
    Slower,
    /// Higher frequency: the local vblank moves forward
    Faster,
}

/// The frequency offset and hold time for one time difference
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseShift {
    /// Difference being corrected, local minus reference, in ms
    pub time_diff_ms: f64,
    /// Offset chosen, in percent
    pub shift_percent: f64,
    /// How long the offset is held
    pub hold: Duration,
    /// Direction of the offset
    pub direction: ShiftDirection,
}

impl PhaseShift {
    /// Plan the shift for `time_diff_ms`
    ///
    /// The hold is truncated to whole milliseconds, so differences shorter
    /// than the offset resolves plan nothing.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate or the
    /// difference is not finite.
    pub fn plan(time_diff_ms: f64, config: &ShiftConfig) -> Result<Self> {
        config.validate()?;
        if !time_diff_ms.is_finite() {
            return Err(VsyncError::invalid_config(format!(
                "time difference must be finite, got {time_diff_ms}"
            )));
        }

        let magnitude_ms = time_diff_ms.abs();
        #[allow(clippy::cast_precision_loss)]
        let large = magnitude_ms * 1000.0 >= config.step_threshold_us as f64;
        let shift_percent = if config.shift2_percent > 0.0 && large {
            config.shift2_percent
        } else {
            config.shift_percent
        };

        // Truncated to the millisecond; the float is finite and non-negative.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let hold_ms = (magnitude_ms * 100.0 / shift_percent) as u64;
        let direction = if time_diff_ms > 0.0 {
            ShiftDirection::Slower
        } else {
            ShiftDirection::Faster
        };

        Ok(Self {
            time_diff_ms,
            shift_percent,
            hold: Duration::from_millis(hold_ms),
            direction,
        })
    }

    /// Whether the plan changes nothing
    pub const fn is_noop(&self) -> bool {
        self.hold.is_zero()
    }

    /// Frequency to hold for a PLL running at `nominal_mhz`
    pub fn target_mhz(&self, nominal_mhz: f64) -> f64 {
        let delta = self.shift_percent * nominal_mhz / 100.0;
        match self.direction {
            ShiftDirection::Slower => nominal_mhz - delta,
            ShiftDirection::Faster => nominal_mhz + delta,
        }
    }
}

/// Progress of a [`ShiftSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftPhase {
    /// Stepping towards the shifted frequency
    Shifting,
    /// At the shifted frequency until `until`
    Holding {
        /// End of the hold
        until: Instant,
    },
    /// Stepping back to nominal
    Returning,
    /// Nothing left to do
    Done,
}

/// A phase shift in progress on one device
#[derive(Debug)]
pub struct ShiftSession<'a> {
    device: &'a mut DeviceHandle,
    codec: &'a mut DklCodec,
    plan: PhaseShift,
    config: ShiftConfig,
    nominal: Vec<(usize, f64)>,
    phase: ShiftPhase,
}

impl<'a> ShiftSession<'a> {
    /// Plan the shift and write its first step on every enabled PHY
    ///
    /// With `commit` off or an empty plan nothing is written and the
    /// session starts out `Done`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig`, `OperationPending` if a PHY is still busy,
    /// or a device or divider error.
    pub fn start(
        device: &'a mut DeviceHandle,
        codec: &'a mut DklCodec,
        time_diff_ms: f64,
        config: &ShiftConfig,
        now: Instant,
    ) -> Result<Self> {
        let plan = PhaseShift::plan(time_diff_ms, config)?;
        info!(
            "Phase shift {time_diff_ms} ms: {:?} by {}% for {:?}",
            plan.direction, plan.shift_percent, plan.hold
        );

        let mut session = Self {
            device,
            codec,
            plan,
            config: *config,
            nominal: Vec::new(),
            phase: ShiftPhase::Done,
        };
        if !config.commit {
            info!("Not committing; registers untouched");
            return Ok(session);
        }
        if plan.is_noop() {
            info!("Difference below resolution; nothing to do");
            return Ok(session);
        }

        for phy in session.codec.find_enabled_phys(session.device)? {
            let nominal = session
                .codec
                .select(session.device, phy)?
                .nominal_frequency_mhz()?;
            session.nominal.push((phy, nominal));
        }
        session.step_all(true, now)?;
        session.phase = ShiftPhase::Shifting;
        Ok(session)
    }

    /// The plan being executed
    pub const fn plan(&self) -> &PhaseShift {
        &self.plan
    }

    /// Current phase
    pub const fn phase(&self) -> ShiftPhase {
        self.phase
    }

    /// PHYs being shifted and their nominal frequency in MHz
    pub fn phys(&self) -> &[(usize, f64)] {
        &self.nominal
    }

    /// Retune every PHY to the shifted frequency, or back to nominal
    fn step_all(&mut self, shifted: bool, now: Instant) -> Result<()> {
        for &(phy, nominal) in &self.nominal {
            let target = if shifted {
                self.plan.target_mhz(nominal)
            } else {
                nominal
            };
            debug!("PHY {phy}: stepping to {target:.6} MHz");
            self.codec
                .select(self.device, phy)?
                .retune_stepped(target, self.config.shift_percent, now)?;
        }
        Ok(())
    }

    /// Do whatever is due at `now`
    ///
    /// # Errors
    ///
    /// Returns a device or divider error; the session can be polled again.
    pub fn poll(&mut self, now: Instant) -> Result<ShiftPhase> {
        self.phase = match self.phase {
            ShiftPhase::Shifting => {
                if self.codec.advance(self.device, now)? == 0 {
                    info!("Shifted; holding for {:?}", self.plan.hold);
                    ShiftPhase::Holding {
                        until: now + self.plan.hold,
                    }
                } else {
                    ShiftPhase::Shifting
                }
            }
            ShiftPhase::Holding { until } if now >= until => {
                if self.config.reset {
                    self.step_all(false, now)?;
                    ShiftPhase::Returning
                } else {
                    info!("Hold elapsed; leaving PLLs shifted");
                    ShiftPhase::Done
                }
            }
            ShiftPhase::Returning => {
                if self.codec.advance(self.device, now)? == 0 {
                    let restored = self.codec.restore_all(self.device)?;
                    info!("Phase shift complete; {restored} PHY(s) restored");
                    ShiftPhase::Done
                } else {
                    ShiftPhase::Returning
                }
            }
            phase @ (ShiftPhase::Holding { .. } | ShiftPhase::Done) => phase,
        };
        Ok(self.phase)
    }

    /// Stop now and put the original registers back
    ///
    /// # Errors
    ///
    /// Returns a device error.
    pub fn abort(&mut self) -> Result<()> {
        if self.phase != ShiftPhase::Done {
            let restored = self.codec.restore_all(self.device)?;
            info!("Phase shift aborted; {restored} PHY(s) restored");
            self.phase = ShiftPhase::Done;
        }
        Ok(())
    }

    /// Poll until done, aborting if `stop` is set
    ///
    /// # Errors
    ///
    /// Returns the first error of [`ShiftSession::poll`] or
    /// [`ShiftSession::abort`].
    pub fn run_to_completion(&mut self, stop: &AtomicBool) -> Result<()> {
        let slice = self
            .codec
            .retune_config()
            .step_interval
            .clamp(Duration::from_millis(1), Duration::from_millis(10));
        loop {
            if stop.load(Ordering::Relaxed) {
                return self.abort();
            }
            if self.poll(Instant::now())? == ShiftPhase::Done {
                return Ok(());
            }
            thread::sleep(slice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SoftwareDevice;
    use crate::codec::DklRegisters;

    fn setup() -> (SoftwareDevice, DeviceHandle, DklCodec) {
        let sim = SoftwareDevice::with_active_phys(&[0, 2]);
        let mut dev = DeviceHandle::simulated(sim.clone());
        dev.map().unwrap();
        (sim, dev, DklCodec::default())
    }

    fn registers(dev: &mut DeviceHandle, phy: usize) -> DklRegisters {
        let mut codec = DklCodec::default();
        codec.select(dev, phy).unwrap().read_registers().unwrap()
    }

    #[test]
    fn plan_hold_and_direction() {
        let cfg = ShiftConfig::default();
        let p = PhaseShift::plan(1.0, &cfg).unwrap();
        assert_eq!(p.hold, Duration::from_millis(1000));
        assert_eq!(p.direction, ShiftDirection::Slower);
        assert!(p.target_mhz(1000.0) < 1000.0);
        assert!((p.target_mhz(1000.0) - 999.0).abs() < 1e-9);

        let p = PhaseShift::plan(-0.25, &cfg).unwrap();
        assert_eq!(p.hold, Duration::from_millis(250));
        assert_eq!(p.direction, ShiftDirection::Faster);
    }

    #[test]
    fn secondary_shift_above_threshold() {
        let cfg = ShiftConfig {
            shift2_percent: 1.0,
            step_threshold_us: 2000,
            ..ShiftConfig::default()
        };
        let small = PhaseShift::plan(1.5, &cfg).unwrap();
        assert_eq!(small.shift_percent, 0.1);
        assert_eq!(small.hold, Duration::from_millis(1500));

        let large = PhaseShift::plan(-4.0, &cfg).unwrap();
        assert_eq!(large.shift_percent, 1.0);
        assert_eq!(large.hold, Duration::from_millis(400));
    }

    #[test]
    fn invalid_shift_is_rejected() {
        for shift_percent in [0.0, -0.1, f64::NAN] {
            let cfg = ShiftConfig {
                shift_percent,
                ..ShiftConfig::default()
            };
            assert!(matches!(
                PhaseShift::plan(1.0, &cfg),
                Err(VsyncError::InvalidConfig { .. })
            ));
        }
    }

    #[test]
    fn no_commit_writes_nothing() {
        let (sim, mut dev, mut codec) = setup();
        let writes = sim.write_count();
        let cfg = ShiftConfig {
            commit: false,
            ..ShiftConfig::default()
        };
        let s = ShiftSession::start(&mut dev, &mut codec, 5.0, &cfg, Instant::now()).unwrap();
        assert_eq!(s.phase(), ShiftPhase::Done);
        assert_eq!(sim.write_count(), writes);
    }

    #[test]
    fn tiny_difference_writes_nothing() {
        let (sim, mut dev, mut codec) = setup();
        let writes = sim.write_count();
        let s = ShiftSession::start(
            &mut dev,
            &mut codec,
            0.0001,
            &ShiftConfig::default(),
            Instant::now(),
        )
        .unwrap();
        assert!(s.plan().is_noop());
        assert_eq!(s.phase(), ShiftPhase::Done);
        assert_eq!(sim.write_count(), writes);
    }

    #[test]
    fn full_cycle_restores_registers() {
        let (_sim, mut dev, mut codec) = setup();
        let before = [registers(&mut dev, 0), registers(&mut dev, 2)];
        let cfg = ShiftConfig {
            shift2_percent: 0.3,
            step_threshold_us: 500,
            ..ShiftConfig::default()
        };
        let t0 = Instant::now();

        {
            let mut s = ShiftSession::start(&mut dev, &mut codec, 0.6, &cfg, t0).unwrap();
            assert_eq!(s.phys().len(), 2);
            assert_eq!(s.plan().hold, Duration::from_millis(200));

            // 0.3 % in 0.1 % steps: the first is written by start
            let mut t = t0;
            let mut shifting_polls = 0;
            while s.poll(t).unwrap() == ShiftPhase::Shifting {
                shifting_polls += 1;
                t += Duration::from_millis(10);
            }
            assert!(shifting_polls >= 1);
            let ShiftPhase::Holding { until } = s.phase() else {
                panic!("expected hold, got {:?}", s.phase());
            };
            assert_eq!(until, t + Duration::from_millis(200));

            assert!(matches!(s.poll(t).unwrap(), ShiftPhase::Holding { .. }));
            assert_eq!(s.poll(until).unwrap(), ShiftPhase::Returning);

            let mut t = until;
            while s.poll(t).unwrap() != ShiftPhase::Done {
                t += Duration::from_millis(10);
            }
        }

        assert!(codec.all_done());
        assert_eq!(registers(&mut dev, 0), before[0]);
        assert_eq!(registers(&mut dev, 2), before[1]);
    }

    #[test]
    fn shifted_frequency_while_holding() {
        let (_sim, mut dev, mut codec) = setup();
        let nominal = {
            let mut c = DklCodec::default();
            c.select(&mut dev, 0).unwrap().frequency_mhz().unwrap()
        };
        let cfg = ShiftConfig {
            reset: false,
            ..ShiftConfig::default()
        };
        let t0 = Instant::now();
        {
            let mut s = ShiftSession::start(&mut dev, &mut codec, 2.0, &cfg, t0).unwrap();
            assert!(matches!(s.poll(t0).unwrap(), ShiftPhase::Holding { .. }));
            assert_eq!(s.poll(t0 + Duration::from_secs(3)).unwrap(), ShiftPhase::Done);
        }
        let now_mhz = codec.select(&mut dev, 0).unwrap().frequency_mhz().unwrap();
        let percent = (now_mhz - nominal) / nominal * 100.0;
        assert!((percent + 0.1).abs() < 1e-6, "{percent}");
    }

    #[test]
    fn abort_restores() {
        let (_sim, mut dev, mut codec) = setup();
        let before = registers(&mut dev, 0);
        {
            let mut s = ShiftSession::start(
                &mut dev,
                &mut codec,
                -3.0,
                &ShiftConfig::default(),
                Instant::now(),
            )
            .unwrap();
            s.abort().unwrap();
            assert_eq!(s.phase(), ShiftPhase::Done);
        }
        assert_eq!(registers(&mut dev, 0), before);
    }
}
