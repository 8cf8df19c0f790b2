// SPDX-License-Identifier: AGPL-3.0-only

//! Software (in-memory) register backend
//!
//! Serves BAR windows out of a shared sparse register file so the codec,
//! control loop and shift sessions run without an iGPU. This enables:
//!
//! 1. **CI without hardware**: every driver test runs against
//!    [`SoftwareDevice`] with registers preloaded to what a Tiger Lake
//!    DKL PHY reports with a display attached.
//!
//! 2. **Fault injection**: maps can be made to fail and the device can be
//!    detached, which revokes every live window (`NotMapped`) the way a
//!    hot-unplugged or reset GPU does.
//!
//! 3. **Write inspection**: tests peek registers and count writes through a
//!    cloned [`SoftwareDevice`] while the handle owns the backend.
//!
//! Unwritten registers read as zero.

use crate::backend::{BackendType, MmioBackend};
use crate::discovery::PciDevice;
use crate::error::{Result, VsyncError};
use crate::mmio::{check_dword, RegisterWindow};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use vsync_chip::bar::MMIO_BAR;
use vsync_chip::dkl::DklRegister;

/// `DKL_PLL_DIV0` of an active Tiger Lake PHY (prediv 2, integer 0x74)
pub const ACTIVE_PLL_DIV0: u32 = 0x5028_4274;
/// `DKL_VISA_SERIALIZER` of an active PHY
pub const ACTIVE_VISA_SERIALIZER: u32 = 0x5432_1000;
/// `DKL_BIAS` of an active PHY (fraction 0x10000)
pub const ACTIVE_BIAS: u32 = 0xC100_0000;
/// `DKL_SSC` of an active PHY
pub const ACTIVE_SSC: u32 = 0x4000_20FF;
/// `DKL_DCO` of an active PHY
pub const ACTIVE_DCO: u32 = 0xE400_4080;

#[derive(Debug, Default)]
struct Shared {
    regs: Mutex<BTreeMap<(usize, usize), u32>>,
    detached: AtomicBool,
    // Bumped on every detach; windows from an older epoch are dead.
    epoch: AtomicU32,
    failing_maps: AtomicU32,
    live_windows: AtomicUsize,
    maps: AtomicUsize,
    writes: AtomicUsize,
}

impl Shared {
    fn regs(&self) -> MutexGuard<'_, BTreeMap<(usize, usize), u32>> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to a simulated register file
///
/// Clones refer to the same registers.
#[derive(Debug, Clone, Default)]
pub struct SoftwareDevice {
    shared: Arc<Shared>,
}

impl SoftwareDevice {
    /// Empty register file: every PHY reads as disabled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register file with the given PHYs active
    #[must_use]
    pub fn with_active_phys(phys: &[usize]) -> Self {
        let device = Self::new();
        for &phy in phys {
            device.activate_phy(phy);
        }
        device
    }

    /// Preload PHY `phy` with active PLL register values
    pub fn activate_phy(&self, phy: usize) {
        for (register, value) in [
            (DklRegister::PllDiv0, ACTIVE_PLL_DIV0),
            (DklRegister::VisaSerializer, ACTIVE_VISA_SERIALIZER),
            (DklRegister::Bias, ACTIVE_BIAS),
            (DklRegister::Ssc, ACTIVE_SSC),
            (DklRegister::Dco, ACTIVE_DCO),
        ] {
            self.poke(register.address(phy), value);
        }
    }

    /// Read a BAR0 register without going through a window
    #[must_use]
    pub fn peek(&self, offset: usize) -> u32 {
        self.peek_bar(MMIO_BAR, offset)
    }

    /// Read a register of any BAR without going through a window
    #[must_use]
    pub fn peek_bar(&self, bar: usize, offset: usize) -> u32 {
        self.shared.regs().get(&(bar, offset)).copied().unwrap_or(0)
    }

    /// Set a BAR0 register without counting it as a write
    pub fn poke(&self, offset: usize, value: u32) {
        self.shared.regs().insert((MMIO_BAR, offset), value);
    }

    /// Revoke every live window and make new maps fail
    pub fn detach(&self) {
        debug!("Software device detached");
        self.shared.detached.store(true, Ordering::SeqCst);
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo [`SoftwareDevice::detach`]; existing windows stay revoked
    pub fn reattach(&self) {
        debug!("Software device reattached");
        self.shared.detached.store(false, Ordering::SeqCst);
    }

    /// Whether the device is detached
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.shared.detached.load(Ordering::SeqCst)
    }

    /// Make the next `count` map attempts fail with `MapFailed`
    pub fn fail_next_maps(&self, count: u32) {
        self.shared.failing_maps.store(count, Ordering::SeqCst);
    }

    /// Windows currently mapped and not yet dropped
    #[must_use]
    pub fn live_windows(&self) -> usize {
        self.shared.live_windows.load(Ordering::SeqCst)
    }

    /// Successful map calls so far
    #[must_use]
    pub fn map_count(&self) -> usize {
        self.shared.maps.load(Ordering::SeqCst)
    }

    /// Register writes through windows so far
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.shared.writes.load(Ordering::SeqCst)
    }

    fn take_map_failure(&self) -> bool {
        self.shared
            .failing_maps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Backend serving windows from a [`SoftwareDevice`]
#[derive(Debug, Clone, Default)]
pub struct SoftwareBackend {
    device: SoftwareDevice,
}

impl SoftwareBackend {
    /// Backend over `device`
    #[must_use]
    pub const fn new(device: SoftwareDevice) -> Self {
        Self { device }
    }

    /// The simulated register file
    #[must_use]
    pub const fn device(&self) -> &SoftwareDevice {
        &self.device
    }
}

impl MmioBackend for SoftwareBackend {
    fn map_window(
        &mut self,
        device: &PciDevice,
        bar: usize,
        len: usize,
    ) -> Result<Box<dyn RegisterWindow>> {
        if self.device.is_detached() {
            return Err(VsyncError::map_failed("device is detached"));
        }
        if self.device.take_map_failure() {
            return Err(VsyncError::map_failed("injected map failure"));
        }
        let bar_size = device.bars.get(bar).map_or(0, |b| b.size);
        if len == 0 || len as u64 > bar_size {
            return Err(VsyncError::map_failed(format!(
                "requested {len:#x} bytes but BAR{bar} is {bar_size:#x} bytes"
            )));
        }

        self.device.shared.maps.fetch_add(1, Ordering::SeqCst);
        self.device.shared.live_windows.fetch_add(1, Ordering::SeqCst);
        debug!("Software map of BAR{bar} ({len:#x} bytes)");

        Ok(Box::new(SoftwareWindow {
            shared: Arc::clone(&self.device.shared),
            bar,
            size: len,
            epoch: self.device.shared.epoch.load(Ordering::SeqCst),
        }))
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Software
    }
}

/// One mapped window onto the shared register file
#[derive(Debug)]
struct SoftwareWindow {
    shared: Arc<Shared>,
    bar: usize,
    size: usize,
    epoch: u32,
}

impl SoftwareWindow {
    fn check_live(&self) -> Result<()> {
        if self.shared.detached.load(Ordering::SeqCst)
            || self.shared.epoch.load(Ordering::SeqCst) != self.epoch
        {
            Err(VsyncError::NotMapped)
        } else {
            Ok(())
        }
    }
}

impl RegisterWindow for SoftwareWindow {
    fn size(&self) -> usize {
        self.size
    }

    fn bar_index(&self) -> usize {
        self.bar
    }

    fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check_live()?;
        check_dword(offset, self.size)?;
        Ok(self.shared.regs().get(&(self.bar, offset)).copied().unwrap_or(0))
    }

    fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.check_live()?;
        check_dword(offset, self.size)?;
        self.shared.regs().insert((self.bar, offset), value);
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for SoftwareWindow {
    fn drop(&mut self) {
        self.shared.live_windows.fetch_sub(1, Ordering::SeqCst);
    }
}
