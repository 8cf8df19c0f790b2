//! DKL PHY register codec
//!
//! Structured access to the PLL block of each DKL PHY. Indexed fields are
//! reachable only through a [`SelectedPhy`], which exists after the HIP index
//! register was programmed for that PHY and mutably borrows both the codec
//! and the device, so no other PHY can be selected while it is alive.
//!
//! The codec also owns the per-PHY `done` flag. A stepped retune leaves
//! `done == false` until its last step has been written by
//! [`DklCodec::advance`]; field writes in that window fail with
//! `OperationPending` and the caller retries on its next cycle.

use crate::device::DeviceHandle;
use crate::error::{Result, VsyncError};
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use vsync_chip::dkl::{
    self, profile, DklField, DklLayout, DklRegister, PllDividers, PllError, MAX_PHYS, PLL_BANK,
};

/// How large frequency changes are broken up
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetuneConfig {
    /// Largest change per register write, in percent of the current
    /// frequency (0 disables stepping)
    pub max_step_percent: f64,
    /// Delay between two steps
    pub step_interval: Duration,
    /// Set the SSC / VISA / DCO profile bits on the first retune
    pub apply_profile: bool,
}

impl Default for RetuneConfig {
    fn default() -> Self {
        Self {
            max_step_percent: 0.1,
            step_interval: Duration::from_millis(10),
            apply_profile: true,
        }
    }
}

impl RetuneConfig {
    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a negative or non-finite step size.
    pub fn validate(&self) -> Result<()> {
        if !self.max_step_percent.is_finite() || self.max_step_percent < 0.0 {
            return Err(VsyncError::invalid_config(format!(
                "max_step_percent must be >= 0, got {}",
                self.max_step_percent
            )));
        }
        Ok(())
    }
}

/// Raw values of the five PLL registers of one PHY
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DklRegisters {
    /// `DKL_PLL_DIV0`
    pub pll_div0: u32,
    /// `DKL_VISA_SERIALIZER`
    pub visa_serializer: u32,
    /// `DKL_BIAS`
    pub bias: u32,
    /// `DKL_SSC`
    pub ssc: u32,
    /// `DKL_DCO`
    pub dco: u32,
}

impl DklRegisters {
    /// Raw value of `register`
    #[must_use]
    pub const fn get(&self, register: DklRegister) -> u32 {
        match register {
            DklRegister::PllDiv0 => self.pll_div0,
            DklRegister::VisaSerializer => self.visa_serializer,
            DklRegister::Bias => self.bias,
            DklRegister::Ssc => self.ssc,
            DklRegister::Dco => self.dco,
        }
    }

    /// Replace the raw value of `register`
    pub fn set(&mut self, register: DklRegister, value: u32) {
        match register {
            DklRegister::PllDiv0 => self.pll_div0 = value,
            DklRegister::VisaSerializer => self.visa_serializer = value,
            DklRegister::Bias => self.bias = value,
            DklRegister::Ssc => self.ssc = value,
            DklRegister::Dco => self.dco = value,
        }
    }

    /// Feedback dividers encoded in these values
    #[must_use]
    pub const fn dividers(&self, layout: &DklLayout) -> PllDividers {
        PllDividers::from_registers(layout, self.pll_div0, self.bias)
    }

    /// Human-readable dump: each register with its address, raw value and
    /// decoded fields, then the PLL frequency.
    #[must_use]
    pub fn describe(&self, phy: usize, layout: &DklLayout) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "DKL PHY {phy}");
        for register in DklRegister::ALL {
            let raw = self.get(register);
            let _ = writeln!(
                out,
                "  {:<20} [{:#08x}] = {raw:#010x}",
                register.name(),
                register.address(phy)
            );
            for (field, fl) in layout.fields_of(register) {
                let high = fl.shift + fl.width - 1;
                let _ = writeln!(
                    out,
                    "      [{high:>2}:{:>2}] {:<22} {:#x}",
                    fl.shift,
                    field.name(),
                    fl.extract(raw)
                );
            }
        }
        let _ = writeln!(
            out,
            "  PLL frequency {:.6} MHz",
            self.dividers(layout).frequency_mhz()
        );
        out
    }
}

/// Outcome of a retune request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetuneStatus {
    /// The target frequency is programmed
    Complete,
    /// The first step is programmed; `remaining` steps follow via `advance`
    InProgress {
        /// Steps still to write
        remaining: u32,
    },
}

impl RetuneStatus {
    /// Whether the target is programmed
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

#[derive(Debug, Clone, Copy)]
struct Retune {
    start_mhz: f64,
    target_mhz: f64,
    step_mhz: f64,
    steps: u32,
    written: u32,
    interval: Duration,
    next_due: Instant,
}

impl Retune {
    fn next_frequency(&self) -> f64 {
        if self.written + 1 >= self.steps {
            self.target_mhz
        } else {
            self.start_mhz + self.step_mhz * f64::from(self.written + 1)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PhyState {
    enabled: bool,
    done: bool,
    original: Option<DklRegisters>,
    retune: Option<Retune>,
}

impl Default for PhyState {
    fn default() -> Self {
        Self {
            enabled: false,
            done: true,
            original: None,
            retune: None,
        }
    }
}

/// Per-device DKL codec
#[derive(Debug, Clone)]
pub struct DklCodec {
    layout: DklLayout,
    retune: RetuneConfig,
    phy_count: usize,
    phys: [PhyState; MAX_PHYS],
}

impl Default for DklCodec {
    fn default() -> Self {
        Self::new(DklLayout::default(), RetuneConfig::default())
    }
}

impl DklCodec {
    /// Codec with the given field layout and retune policy, addressing
    /// every PHY the HIP index registers can select
    #[must_use]
    pub fn new(layout: DklLayout, retune: RetuneConfig) -> Self {
        Self {
            layout,
            retune,
            phy_count: MAX_PHYS,
            phys: [PhyState::default(); MAX_PHYS],
        }
    }

    /// Codec limited to the PHYs wired on `device`'s platform
    #[must_use]
    pub fn for_device(device: &DeviceHandle, layout: DklLayout, retune: RetuneConfig) -> Self {
        let platform = device.info().platform;
        tracing::debug!(
            "{} has {} DKL PHY(s)",
            platform.name(),
            platform.dkl_phy_count()
        );
        Self::new(layout, retune).with_phy_count(platform.dkl_phy_count())
    }

    /// Limit the codec to PHYs `0..count` (at most 6)
    #[must_use]
    pub fn with_phy_count(mut self, count: usize) -> Self {
        self.phy_count = count.min(MAX_PHYS);
        self
    }

    /// Number of addressable PHYs
    #[must_use]
    pub const fn phy_count(&self) -> usize {
        self.phy_count
    }

    /// Field layout in use
    #[must_use]
    pub const fn layout(&self) -> &DklLayout {
        &self.layout
    }

    /// Retune policy in use
    #[must_use]
    pub const fn retune_config(&self) -> &RetuneConfig {
        &self.retune
    }

    /// Program the HIP index register for `phy` and return the token for
    /// its PLL registers
    ///
    /// Only the byte belonging to `phy` changes; the other PHYs' bank
    /// selectors in the shared index register are preserved.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIndex` for `phy >= phy_count()`, or a device error.
    pub fn select<'a>(
        &'a mut self,
        device: &'a mut DeviceHandle,
        phy: usize,
    ) -> Result<SelectedPhy<'a>> {
        if phy >= self.phy_count {
            return Err(VsyncError::InvalidIndex {
                index: phy,
                count: self.phy_count,
            });
        }

        let reg = dkl::hip_index_reg(phy);
        let shift = dkl::hip_index_shift(phy);
        let mask = vsync_chip::bits::field_mask(shift, dkl::HIP_INDEX_WIDTH);
        let current = device.read_dword(reg)?;
        let wanted = (current & !mask) | dkl::hip_index_val(phy, PLL_BANK);
        if wanted != current {
            device.write_dword(reg, wanted)?;
        }
        tracing::trace!("Selected DKL PHY {phy} (index {reg:#x} = {wanted:#010x})");

        Ok(SelectedPhy {
            codec: self,
            device,
            phy,
        })
    }

    /// Probe every PHY and record which ones drive a display
    ///
    /// A PHY is enabled when `DKL_PLL_DIV0` reads neither 0 nor all-ones.
    ///
    /// # Errors
    ///
    /// Returns a device error if a probe read fails.
    pub fn find_enabled_phys(&mut self, device: &mut DeviceHandle) -> Result<Vec<usize>> {
        let mut enabled = Vec::new();
        for phy in 0..self.phy_count {
            let div0 = self.select(device, phy)?.read_register(DklRegister::PllDiv0)?;
            let on = div0 != 0 && div0 != u32::MAX;
            self.phys[phy].enabled = on;
            if on {
                tracing::debug!("DKL PHY {phy} is on (DKL_PLL_DIV0 = {div0:#010x})");
                enabled.push(phy);
            }
        }
        tracing::info!("{} DKL PHY(s) enabled: {enabled:?}", enabled.len());
        Ok(enabled)
    }

    /// PHYs found enabled by the last probe
    #[must_use]
    pub fn enabled_phys(&self) -> Vec<usize> {
        (0..self.phy_count).filter(|&p| self.phys[p].enabled).collect()
    }

    /// Whether `phy` has no operation in flight
    #[must_use]
    pub fn is_done(&self, phy: usize) -> bool {
        self.phys.get(phy).map_or(true, |s| s.done)
    }

    /// Whether every PHY is done
    #[must_use]
    pub fn all_done(&self) -> bool {
        self.phys.iter().all(|s| s.done)
    }

    /// Registers saved before the first retune of `phy`
    #[must_use]
    pub fn saved_registers(&self, phy: usize) -> Option<DklRegisters> {
        self.phys.get(phy).and_then(|s| s.original)
    }

    /// Write every retune step that is due at `now`
    ///
    /// Returns the number of PHYs still in flight afterwards.
    ///
    /// # Errors
    ///
    /// Returns a device error; the failed step stays due.
    pub fn advance(&mut self, device: &mut DeviceHandle, now: Instant) -> Result<usize> {
        for phy in 0..self.phy_count {
            if self.phys[phy].retune.is_some() {
                self.select(device, phy)?.advance(now)?;
            }
        }
        Ok(self.phys.iter().filter(|s| !s.done).count())
    }

    /// Restore the saved registers of every PHY that was retuned
    ///
    /// # Errors
    ///
    /// Returns the first device error; PHYs after it are not restored.
    pub fn restore_all(&mut self, device: &mut DeviceHandle) -> Result<usize> {
        let mut restored = 0;
        for phy in 0..self.phy_count {
            if self.phys[phy].original.is_some() && self.select(device, phy)?.restore()? {
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Forget saved registers and in-flight work without touching hardware
    pub fn reset(&mut self) {
        for state in &mut self.phys {
            let enabled = state.enabled;
            *state = PhyState {
                enabled,
                ..PhyState::default()
            };
        }
    }
}

/// A PHY whose PLL bank is selected
#[derive(Debug)]
pub struct SelectedPhy<'a> {
    codec: &'a mut DklCodec,
    device: &'a mut DeviceHandle,
    phy: usize,
}

impl SelectedPhy<'_> {
    /// PHY index
    #[must_use]
    pub const fn phy(&self) -> usize {
        self.phy
    }

    /// Whether no operation is in flight on this PHY
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state().done
    }

    /// Registers saved before the first retune, if any
    #[must_use]
    pub fn saved_registers(&self) -> Option<DklRegisters> {
        self.state().original
    }

    fn state(&self) -> &PhyState {
        &self.codec.phys[self.phy]
    }

    fn state_mut(&mut self) -> &mut PhyState {
        &mut self.codec.phys[self.phy]
    }

    /// Read one raw PLL register
    ///
    /// # Errors
    ///
    /// Returns a device error.
    pub fn read_register(&self, register: DklRegister) -> Result<u32> {
        self.device.read_dword(register.address(self.phy))
    }

    fn write_register(&mut self, register: DklRegister, value: u32) -> Result<()> {
        tracing::trace!("PHY {} {} <- {value:#010x}", self.phy, register.name());
        self.device.write_dword(register.address(self.phy), value)
    }

    /// Read all five PLL registers
    ///
    /// # Errors
    ///
    /// Returns a device error.
    pub fn read_registers(&self) -> Result<DklRegisters> {
        let mut regs = DklRegisters::default();
        for register in DklRegister::ALL {
            regs.set(register, self.read_register(register)?);
        }
        Ok(regs)
    }

    fn write_registers(&mut self, regs: &DklRegisters) -> Result<()> {
        for register in DklRegister::ALL {
            self.write_register(register, regs.get(register))?;
        }
        Ok(())
    }

    /// Read a field
    ///
    /// # Errors
    ///
    /// Returns a device error.
    pub fn read_field(&self, field: DklField) -> Result<u32> {
        let layout = self.codec.layout.field(field);
        Ok(layout.extract(self.read_register(layout.register)?))
    }

    /// Read-modify-write a field
    ///
    /// # Errors
    ///
    /// Returns `OperationPending` while a retune is in flight and
    /// `ValueOutOfRange` if `value` does not fit; the register is untouched
    /// in both cases.
    pub fn write_field(&mut self, field: DklField, value: u64) -> Result<()> {
        if !self.is_done() {
            return Err(VsyncError::OperationPending { phy: self.phy });
        }
        let layout = self.codec.layout.field(field);
        if !layout.fits(value) {
            return Err(VsyncError::ValueOutOfRange {
                field: field.name(),
                value,
                width: layout.width,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let value = value as u32;

        let raw = self.read_register(layout.register)?;
        self.write_register(layout.register, layout.insert(raw, value))
    }

    /// Current feedback dividers
    ///
    /// # Errors
    ///
    /// Returns a device error.
    pub fn dividers(&self) -> Result<PllDividers> {
        Ok(self.read_registers()?.dividers(&self.codec.layout))
    }

    /// Current PLL output frequency in MHz
    ///
    /// # Errors
    ///
    /// Returns a device error.
    pub fn frequency_mhz(&self) -> Result<f64> {
        Ok(self.dividers()?.frequency_mhz())
    }

    /// Frequency before the first retune: the saved registers if any,
    /// otherwise the live ones
    ///
    /// # Errors
    ///
    /// Returns a device error.
    pub fn nominal_frequency_mhz(&self) -> Result<f64> {
        match self.saved_registers() {
            Some(regs) => Ok(regs.dividers(&self.codec.layout).frequency_mhz()),
            None => self.frequency_mhz(),
        }
    }

    /// Retune towards `target_mhz` with the configured step size
    ///
    /// # Errors
    ///
    /// See [`SelectedPhy::retune_stepped`].
    pub fn retune(&mut self, target_mhz: f64, now: Instant) -> Result<RetuneStatus> {
        let step = self.codec.retune.max_step_percent;
        self.retune_stepped(target_mhz, step, now)
    }

    /// Retune towards `target_mhz`, at most `max_step_percent` per write
    ///
    /// Saves the original registers (and sets the profile bits) on the
    /// first retune of this PHY. The first step is written now; further
    /// steps are written by `advance` once each is due.
    ///
    /// # Errors
    ///
    /// - `OperationPending` if a retune is already in flight
    /// - `InvalidDividers` if the PLL reports a zero pre-divider or the
    ///   target is not a positive frequency
    /// - `ValueOutOfRange` if the target needs an integer divider wider
    ///   than its field
    ///
    /// Nothing is written when an error is returned before the first step.
    pub fn retune_stepped(
        &mut self,
        target_mhz: f64,
        max_step_percent: f64,
        now: Instant,
    ) -> Result<RetuneStatus> {
        if !self.is_done() {
            return Err(VsyncError::OperationPending { phy: self.phy });
        }

        let layout = self.codec.layout;
        let current = self.read_registers()?;
        let dividers = current.dividers(&layout);
        let current_mhz = dividers.frequency_mhz();

        // Validate the final target before any register changes.
        self.encode(target_mhz, dividers.prediv)?;
        if current_mhz <= 0.0 {
            return Err(VsyncError::invalid_dividers(format!(
                "PHY {} reports {current_mhz} MHz",
                self.phy
            )));
        }

        let (steps, step_mhz) = plan_steps(current_mhz, target_mhz, max_step_percent);
        tracing::debug!(
            "PHY {}: {current_mhz:.6} -> {target_mhz:.6} MHz in {steps} step(s)",
            self.phy
        );

        if self.state().original.is_none() {
            self.state_mut().original = Some(current);
            if self.codec.retune.apply_profile {
                self.write_profile(&current)?;
            }
        }

        let mut retune = Retune {
            start_mhz: current_mhz,
            target_mhz,
            step_mhz,
            steps,
            written: 0,
            interval: self.codec.retune.step_interval,
            next_due: now,
        };
        self.program_frequency(retune.next_frequency(), dividers.prediv)?;
        retune.written = 1;

        if retune.written >= retune.steps {
            return Ok(RetuneStatus::Complete);
        }
        retune.next_due = now + retune.interval;
        let remaining = retune.steps - retune.written;
        let state = self.state_mut();
        state.retune = Some(retune);
        state.done = false;
        Ok(RetuneStatus::InProgress { remaining })
    }

    /// Write the next step of an in-flight retune if it is due
    ///
    /// Returns whether the PHY is done afterwards.
    ///
    /// # Errors
    ///
    /// Returns a device error or a divider error; the step stays due.
    pub fn advance(&mut self, now: Instant) -> Result<bool> {
        let Some(mut retune) = self.state().retune else {
            return Ok(true);
        };
        if now < retune.next_due {
            return Ok(false);
        }

        let phy = self.phy;
        let prediv = self.dividers()?.prediv;
        self.program_frequency(retune.next_frequency(), prediv)?;
        retune.written += 1;
        tracing::trace!("PHY {phy} step {}/{}", retune.written, retune.steps);

        let state = self.state_mut();
        if retune.written >= retune.steps {
            state.retune = None;
            state.done = true;
            tracing::debug!("PHY {phy} retune complete");
        } else {
            retune.next_due = now + retune.interval;
            state.retune = Some(retune);
        }
        Ok(state.done)
    }

    /// Put back the registers saved before the first retune
    ///
    /// Cancels any in-flight retune. Returns whether anything was saved.
    ///
    /// # Errors
    ///
    /// Returns a device error; the saved values are kept for a retry.
    pub fn restore(&mut self) -> Result<bool> {
        let Some(original) = self.state().original else {
            return Ok(false);
        };
        self.write_registers(&original)?;
        let enabled = self.state().enabled;
        *self.state_mut() = PhyState {
            enabled,
            ..PhyState::default()
        };
        tracing::info!("PHY {} registers restored", self.phy);
        Ok(true)
    }

    fn encode(&self, target_mhz: f64, prediv: u32) -> Result<PllDividers> {
        PllDividers::for_frequency(target_mhz, prediv, &self.codec.layout)
            .map_err(|e| self.pll_error(e))
    }

    fn pll_error(&self, e: PllError) -> VsyncError {
        match e {
            PllError::Overflow {
                field,
                value,
                width,
            } => VsyncError::ValueOutOfRange {
                field: field.name(),
                value,
                width,
            },
            PllError::ZeroPrediv | PllError::InvalidTarget(_) | PllError::FractionScale { .. } => {
                VsyncError::invalid_dividers(format!("PHY {}: {e}", self.phy))
            }
        }
    }

    fn program_frequency(&mut self, mhz: f64, prediv: u32) -> Result<()> {
        let dividers = self.encode(mhz, prediv)?;
        let div0 = self.read_register(DklRegister::PllDiv0)?;
        let bias = self.read_register(DklRegister::Bias)?;
        let (div0, bias) = dividers
            .apply(&self.codec.layout, div0, bias)
            .map_err(|e| self.pll_error(e))?;
        self.write_register(DklRegister::PllDiv0, div0)?;
        self.write_register(DklRegister::Bias, bias)
    }

    fn write_profile(&mut self, current: &DklRegisters) -> Result<()> {
        let l = self.codec.layout;
        let ssc = l.spread_spectrum.insert(current.ssc, profile::SSC_IREF_NDIV_RATIO);
        let ssc = l.ssc_enable.insert(ssc, profile::SSC_ENABLE);
        let visa = l
            .visa_serializer
            .insert(current.visa_serializer, profile::VISA_SERIALIZER_ALIGN)
            | profile::VISA_SERIALIZER_EXTRA;
        let dco = l.dco.insert(current.dco, profile::DCO_AMP_OVRD_EN);

        self.write_register(DklRegister::VisaSerializer, visa)?;
        self.write_register(DklRegister::Ssc, ssc)?;
        self.write_register(DklRegister::Dco, dco)
    }
}

/// Number of writes and frequency increment for a change from `current`
/// to `target`, each step at most `max_step_percent` of `current`.
fn plan_steps(current_mhz: f64, target_mhz: f64, max_step_percent: f64) -> (u32, f64) {
    let total = target_mhz - current_mhz;
    // Percent difference rounded to 4 decimals, so float noise right at the
    // limit does not add a step.
    let percent = (total.abs() / current_mhz * 100.0 * 10_000.0).round() / 10_000.0;
    if max_step_percent <= 0.0 || percent <= max_step_percent {
        return (1, total);
    }

    let ideal = current_mhz * max_step_percent / 100.0;
    let steps = (total.abs() / ideal).ceil();
    // Bounded by percent / max_step_percent, far below u32::MAX in practice.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let steps = steps.clamp(1.0, f64::from(u32::MAX)) as u32;
    (steps, total / f64::from(steps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::software::{self, SoftwareDevice};

    fn mapped(phys: &[usize]) -> (SoftwareDevice, DeviceHandle) {
        let sim = SoftwareDevice::with_active_phys(phys);
        let mut dev = DeviceHandle::simulated(sim.clone());
        dev.map().unwrap();
        (sim, dev)
    }

    #[test]
    fn select_touches_only_own_index_byte() {
        let (sim, mut dev) = mapped(&[]);
        sim.poke(dkl::HIP_INDEX_REG0, 0xAABB_CCDD);
        let mut codec = DklCodec::default();

        codec.select(&mut dev, 1).unwrap();
        assert_eq!(sim.peek(dkl::HIP_INDEX_REG0), 0xAABB_02DD);

        codec.select(&mut dev, 5).unwrap();
        assert_eq!(sim.peek(dkl::HIP_INDEX_REG1), 0x0000_0200);
        assert_eq!(sim.peek(dkl::HIP_INDEX_REG0), 0xAABB_02DD);
    }

    #[test]
    fn select_rejects_out_of_range_phy() {
        let (_, mut dev) = mapped(&[]);
        let mut codec = DklCodec::default();
        assert!(matches!(
            codec.select(&mut dev, MAX_PHYS),
            Err(VsyncError::InvalidIndex { index: 6, count: 6 })
        ));
    }

    #[test]
    fn platform_bounds_phy_index() {
        let (sim, mut dev) = mapped(&[0, 4]);
        let adl_p = vsync_chip::pcie::Platform::AlderLakeP;
        let mut codec = DklCodec::default().with_phy_count(adl_p.dkl_phy_count());
        let writes = sim.write_count();

        assert!(matches!(
            codec.select(&mut dev, 4),
            Err(VsyncError::InvalidIndex { index: 4, count: 4 })
        ));
        assert_eq!(codec.find_enabled_phys(&mut dev).unwrap(), vec![0]);
        assert_eq!(sim.peek(dkl::HIP_INDEX_REG1), 0);
        assert_eq!(sim.write_count() - writes, 4, "one index write per PHY");
    }

    #[test]
    fn codec_follows_device_platform() {
        let sim = SoftwareDevice::with_active_phys(&[0]);
        let mut info = crate::discovery::PciDevice::simulated();
        info.platform = vsync_chip::pcie::Platform::AlderLakeP;
        let dev = DeviceHandle::with_backend(
            info,
            Box::new(crate::backends::SoftwareBackend::new(sim)),
        );
        let codec = DklCodec::for_device(&dev, DklLayout::default(), RetuneConfig::default());
        assert_eq!(codec.phy_count(), 4);

        let tgl = DeviceHandle::simulated(SoftwareDevice::new());
        let codec = DklCodec::for_device(&tgl, DklLayout::default(), RetuneConfig::default());
        assert_eq!(codec.phy_count(), MAX_PHYS);
    }

    #[test]
    fn field_roundtrip_on_every_phy() {
        let (_, mut dev) = mapped(&[0, 1, 2, 3, 4, 5]);
        let mut codec = DklCodec::default();
        for phy in 0..MAX_PHYS {
            let mut sel = codec.select(&mut dev, phy).unwrap();
            for field in DklField::ALL {
                let width = sel.codec.layout.field(field).width;
                let value = vsync_chip::bits::field_max(width) / 3;
                sel.write_field(field, value).unwrap();
                assert_eq!(u64::from(sel.read_field(field).unwrap()), value, "{field}");
            }
        }
    }

    #[test]
    fn oversized_value_leaves_register_unchanged() {
        let (sim, mut dev) = mapped(&[0]);
        let mut codec = DklCodec::default();
        let mut sel = codec.select(&mut dev, 0).unwrap();
        sel.write_field(DklField::Divider, 200).unwrap();
        let before = sim.peek(DklRegister::PllDiv0.address(0));

        assert!(matches!(
            sel.write_field(DklField::Divider, 300),
            Err(VsyncError::ValueOutOfRange { width: 8, value: 300, .. })
        ));
        assert_eq!(sel.read_field(DklField::Divider).unwrap(), 200);
        assert_eq!(sim.peek(DklRegister::PllDiv0.address(0)), before);
    }

    #[test]
    fn write_does_not_disturb_neighbouring_fields() {
        let (sim, mut dev) = mapped(&[2]);
        let mut codec = DklCodec::default();
        codec
            .select(&mut dev, 2)
            .unwrap()
            .write_field(DklField::Prediv, 3)
            .unwrap();
        assert_eq!(sim.peek(DklRegister::PllDiv0.address(2)), 0x5028_4374);
    }

    #[test]
    fn enabled_phy_detection() {
        let (sim, mut dev) = mapped(&[1, 4]);
        sim.poke(DklRegister::PllDiv0.address(2), u32::MAX);
        let mut codec = DklCodec::default();
        assert_eq!(codec.find_enabled_phys(&mut dev).unwrap(), vec![1, 4]);
        assert_eq!(codec.enabled_phys(), vec![1, 4]);
    }

    #[test]
    fn small_retune_completes_at_once() {
        let (_, mut dev) = mapped(&[0]);
        let mut codec = DklCodec::default();
        let now = Instant::now();
        let mut sel = codec.select(&mut dev, 0).unwrap();
        let f0 = sel.frequency_mhz().unwrap();

        let status = sel.retune(f0 * (1.0 - 50e-6), now).unwrap();
        assert_eq!(status, RetuneStatus::Complete);
        assert!(sel.is_done());
        let lsb = dkl::REF_FREQ_MHZ * 2.0 / 4_194_304.0;
        assert!((sel.frequency_mhz().unwrap() - f0 * (1.0 - 50e-6)).abs() <= lsb);
        assert!((sel.nominal_frequency_mhz().unwrap() - f0).abs() < 1e-9);
    }

    #[test]
    fn large_retune_is_stepped() {
        let (_, mut dev) = mapped(&[0]);
        let mut codec = DklCodec::default();
        let start = Instant::now();
        let interval = codec.retune_config().step_interval;

        let target = {
            let mut sel = codec.select(&mut dev, 0).unwrap();
            let f0 = sel.frequency_mhz().unwrap();
            let target = f0 * 1.0035;
            let status = sel.retune(target, start).unwrap();
            // 0.35% in steps of at most 0.1%
            assert_eq!(status, RetuneStatus::InProgress { remaining: 3 });
            assert!(matches!(
                sel.write_field(DklField::Dco, 0),
                Err(VsyncError::OperationPending { phy: 0 })
            ));
            assert!(matches!(
                sel.retune(f0, start),
                Err(VsyncError::OperationPending { .. })
            ));
            target
        };
        assert!(!codec.is_done(0));

        // Not due yet
        assert_eq!(codec.advance(&mut dev, start).unwrap(), 1);

        let mut now = start;
        for _ in 0..3 {
            now += interval;
            codec.advance(&mut dev, now).unwrap();
        }
        assert!(codec.is_done(0));
        let f = codec.select(&mut dev, 0).unwrap().frequency_mhz().unwrap();
        assert!((f - target).abs() < 1e-3);
    }

    #[test]
    fn retune_sets_profile_and_restore_undoes_everything() {
        let (sim, mut dev) = mapped(&[3]);
        let mut codec = DklCodec::default();
        let now = Instant::now();

        let mut sel = codec.select(&mut dev, 3).unwrap();
        let f0 = sel.frequency_mhz().unwrap();
        sel.retune(f0 * 0.9995, now).unwrap();
        let ssc = sim.peek(DklRegister::Ssc.address(3));
        assert_eq!(ssc >> 29, profile::SSC_IREF_NDIV_RATIO);
        assert_ne!(ssc & (1 << 13), 0);
        assert_ne!(sim.peek(DklRegister::VisaSerializer.address(3)) & (1 << 9), 0);
        assert_ne!(sim.peek(DklRegister::Dco.address(3)) & (1 << 2), 0);
        assert!(sel.saved_registers().is_some());

        assert!(sel.restore().unwrap());
        assert!(sel.saved_registers().is_none());
        assert!(!sel.restore().unwrap());
        assert_eq!(sim.peek(DklRegister::PllDiv0.address(3)), software::ACTIVE_PLL_DIV0);
        assert_eq!(sim.peek(DklRegister::Bias.address(3)), software::ACTIVE_BIAS);
        assert_eq!(sim.peek(DklRegister::Ssc.address(3)), software::ACTIVE_SSC);
        assert_eq!(
            sim.peek(DklRegister::VisaSerializer.address(3)),
            software::ACTIVE_VISA_SERIALIZER
        );
        assert_eq!(sim.peek(DklRegister::Dco.address(3)), software::ACTIVE_DCO);
    }

    #[test]
    fn restore_cancels_in_flight_retune() {
        let (sim, mut dev) = mapped(&[0]);
        let mut codec = DklCodec::default();
        let now = Instant::now();
        {
            let mut sel = codec.select(&mut dev, 0).unwrap();
            let f0 = sel.frequency_mhz().unwrap();
            sel.retune(f0 * 0.99, now).unwrap();
        }
        assert!(!codec.all_done());
        assert_eq!(codec.restore_all(&mut dev).unwrap(), 1);
        assert!(codec.all_done());
        assert_eq!(sim.peek(DklRegister::PllDiv0.address(0)), software::ACTIVE_PLL_DIV0);
    }

    #[test]
    fn retune_of_disabled_phy_fails_without_writes() {
        let (sim, mut dev) = mapped(&[]);
        let mut codec = DklCodec::default();
        codec.select(&mut dev, 0).unwrap();
        let writes = sim.write_count();
        let mut sel = codec.select(&mut dev, 0).unwrap();
        assert!(matches!(
            sel.retune(100.0, Instant::now()),
            Err(VsyncError::InvalidDividers { .. })
        ));
        assert_eq!(sim.write_count(), writes);
        assert!(sel.saved_registers().is_none());
    }

    #[test]
    fn retune_beyond_integer_field_is_rejected() {
        let (_, mut dev) = mapped(&[0]);
        let mut codec = DklCodec::default();
        let mut sel = codec.select(&mut dev, 0).unwrap();
        // prediv 2: integer 256 needs 9 bits
        assert!(matches!(
            sel.retune(dkl::REF_FREQ_MHZ * 2.0 * 256.0, Instant::now()),
            Err(VsyncError::ValueOutOfRange { value: 256, .. })
        ));
    }

    #[test]
    fn step_planning() {
        assert_eq!(plan_steps(100.0, 100.05, 0.1), (1, 100.05 - 100.0));
        let (steps, step) = plan_steps(100.0, 99.65, 0.1);
        assert_eq!(steps, 4);
        assert!((step - (-0.0875)).abs() < 1e-9);
        assert_eq!(plan_steps(100.0, 90.0, 0.0).0, 1);
    }

    #[test]
    fn describe_lists_fields() {
        let regs = DklRegisters {
            pll_div0: software::ACTIVE_PLL_DIV0,
            visa_serializer: software::ACTIVE_VISA_SERIALIZER,
            bias: software::ACTIVE_BIAS,
            ssc: software::ACTIVE_SSC,
            dco: software::ACTIVE_DCO,
        };
        let text = regs.describe(0, &DklLayout::default());
        assert!(text.contains("DKL_PLL_DIV0"));
        assert!(text.contains("fbdiv_intgr"));
        assert!(text.contains("0x74"));
        assert!(text.contains("[0x168200]"));
        assert!(text.contains("PLL frequency 8910.000000 MHz"));
    }
}
