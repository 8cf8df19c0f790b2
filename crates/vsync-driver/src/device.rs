//! Device handle and mapping lifecycle
//!
//! ```text
//!   open ──► Uninit ──map──► Init ──close──► Uninit ──map──► Init ...
//! ```
//!
//! A handle owns its register windows. `map` builds every window before it
//! commits, so a failed map leaves the handle exactly as it was; `close`
//! drops them all at once and is safe from any state.

use crate::backend::{BackendType, MmioBackend};
use crate::backends::{SoftwareBackend, SoftwareDevice, SysfsBackend};
use crate::discovery::{DeviceManager, DeviceSelector, PciDevice};
use crate::error::{Result, VsyncError};
use crate::mmio::RegisterWindow;
use std::path::Path;
use vsync_chip::bar::{MMIO_BAR, MMIO_SIZE};

/// Mapping state of a [`DeviceHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Nothing mapped
    Uninit,
    /// Register window (and optional cmn window) mapped
    Init,
}

#[derive(Debug)]
struct Windows {
    mmio: Box<dyn RegisterWindow>,
    cmn: Option<Box<dyn RegisterWindow>>,
}

/// Caller-owned handle to one display controller
#[derive(Debug)]
pub struct DeviceHandle {
    info: PciDevice,
    backend: Box<dyn MmioBackend>,
    windows: Option<Windows>,
    cmn_request: Option<(usize, usize)>,
}

impl DeviceHandle {
    /// Open the first supported display controller matching `selector`
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` or `UnsupportedDevice`.
    pub fn open(selector: &DeviceSelector) -> Result<Self> {
        Self::open_in(crate::discovery::SYSFS_PCI_DEVICES, selector)
    }

    /// Like [`DeviceHandle::open`] with an explicit PCI sysfs root
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound`, `UnsupportedDevice` or an I/O error if the
    /// root cannot be scanned.
    pub fn open_in(root: impl AsRef<Path>, selector: &DeviceSelector) -> Result<Self> {
        let manager = DeviceManager::discover_in(root)?;
        let info = manager.select(selector)?.clone();
        Ok(Self::with_backend(info, Box::new(SysfsBackend::new())))
    }

    /// Handle over an arbitrary backend
    #[must_use]
    pub fn with_backend(info: PciDevice, backend: Box<dyn MmioBackend>) -> Self {
        tracing::debug!(
            "Opened {} ({:04x}:{:04x}) with {} backend",
            info.address,
            info.vendor_id,
            info.device_id,
            backend.backend_type()
        );
        Self {
            info,
            backend,
            windows: None,
            cmn_request: None,
        }
    }

    /// Handle over a simulated Tiger Lake iGPU
    #[must_use]
    pub fn simulated(device: SoftwareDevice) -> Self {
        Self::with_backend(
            PciDevice::simulated(),
            Box::new(SoftwareBackend::new(device)),
        )
    }

    /// PCI identity of the device
    #[must_use]
    pub const fn info(&self) -> &PciDevice {
        &self.info
    }

    /// Backend in use
    #[must_use]
    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> DeviceState {
        if self.windows.is_some() {
            DeviceState::Init
        } else {
            DeviceState::Uninit
        }
    }

    /// Whether the registers are mapped
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.windows.is_some()
    }

    /// Map the register window (first 2 MiB of BAR0)
    ///
    /// A handle previously mapped with a cmn window maps it again.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyMapped` if mapped, or `MapFailed`.
    pub fn map(&mut self) -> Result<()> {
        self.map_windows(self.cmn_request)
    }

    /// Map the register window together with the cmn window
    ///
    /// # Errors
    ///
    /// Returns `AlreadyMapped` if mapped, or `MapFailed` if either window
    /// cannot be mapped; in that case nothing stays mapped.
    pub fn map_with_cmn(&mut self, bar: usize, size: usize) -> Result<()> {
        self.map_windows(Some((bar, size)))
    }

    fn map_windows(&mut self, cmn: Option<(usize, usize)>) -> Result<()> {
        if self.windows.is_some() {
            return Err(VsyncError::AlreadyMapped);
        }

        let mmio = self.backend.map_window(&self.info, MMIO_BAR, MMIO_SIZE)?;
        // A cmn failure drops `mmio` on the way out.
        let cmn_window = match cmn {
            Some((bar, size)) => Some(self.backend.map_window(&self.info, bar, size)?),
            None => None,
        };

        self.windows = Some(Windows {
            mmio,
            cmn: cmn_window,
        });
        self.cmn_request = cmn;
        tracing::info!("Mapped registers of {}", self.info.address);
        Ok(())
    }

    /// Unmap every window; a no-op when nothing is mapped
    pub fn close(&mut self) {
        if self.windows.take().is_some() {
            tracing::info!("Unmapped registers of {}", self.info.address);
        }
    }

    fn windows(&self) -> Result<&Windows> {
        self.windows.as_ref().ok_or(VsyncError::NotMapped)
    }

    fn windows_mut(&mut self) -> Result<&mut Windows> {
        self.windows.as_mut().ok_or(VsyncError::NotMapped)
    }

    /// Read a register dword
    ///
    /// # Errors
    ///
    /// Returns `NotMapped` or `OutOfRange`.
    pub fn read_dword(&self, offset: usize) -> Result<u32> {
        self.windows()?.mmio.read_u32(offset)
    }

    /// Write a register dword
    ///
    /// # Errors
    ///
    /// Returns `NotMapped` or `OutOfRange`.
    pub fn write_dword(&mut self, offset: usize, value: u32) -> Result<()> {
        self.windows_mut()?.mmio.write_u32(offset, value)
    }

    /// Read a cmn window dword
    ///
    /// # Errors
    ///
    /// Returns `NotMapped` if the handle or the cmn window is not mapped,
    /// or `OutOfRange`.
    pub fn read_cmn_dword(&self, offset: usize) -> Result<u32> {
        self.windows()?
            .cmn
            .as_ref()
            .ok_or(VsyncError::NotMapped)?
            .read_u32(offset)
    }

    /// Write a cmn window dword
    ///
    /// # Errors
    ///
    /// Returns `NotMapped` if the handle or the cmn window is not mapped,
    /// or `OutOfRange`.
    pub fn write_cmn_dword(&mut self, offset: usize, value: u32) -> Result<()> {
        self.windows_mut()?
            .cmn
            .as_mut()
            .ok_or(VsyncError::NotMapped)?
            .write_u32(offset, value)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_before_map_fail() {
        let mut dev = DeviceHandle::simulated(SoftwareDevice::new());
        assert_eq!(dev.state(), DeviceState::Uninit);
        assert!(matches!(dev.read_dword(0), Err(VsyncError::NotMapped)));
        assert!(matches!(dev.write_dword(0, 1), Err(VsyncError::NotMapped)));
        assert!(matches!(dev.read_cmn_dword(0), Err(VsyncError::NotMapped)));
    }

    #[test]
    fn lifecycle() {
        let sim = SoftwareDevice::new();
        let mut dev = DeviceHandle::simulated(sim.clone());
        dev.map().unwrap();
        assert_eq!(dev.state(), DeviceState::Init);
        assert!(matches!(dev.map(), Err(VsyncError::AlreadyMapped)));

        dev.write_dword(0x10, 5).unwrap();
        assert_eq!(dev.read_dword(0x10).unwrap(), 5);

        dev.close();
        dev.close();
        assert_eq!(sim.live_windows(), 0);
        assert!(matches!(dev.read_dword(0x10), Err(VsyncError::NotMapped)));

        dev.map().unwrap();
        assert_eq!(dev.read_dword(0x10).unwrap(), 5);
    }

    #[test]
    fn out_of_range_access() {
        let mut dev = DeviceHandle::simulated(SoftwareDevice::new());
        dev.map().unwrap();
        assert!(matches!(
            dev.read_dword(MMIO_SIZE),
            Err(VsyncError::OutOfRange { .. })
        ));
        assert!(matches!(
            dev.write_dword(MMIO_SIZE - 2, 0),
            Err(VsyncError::OutOfRange { .. })
        ));
        assert!(dev.read_dword(MMIO_SIZE - 4).is_ok());
    }

    #[test]
    fn failed_cmn_map_leaves_nothing_mapped() {
        let sim = SoftwareDevice::new();
        let mut dev = DeviceHandle::simulated(sim.clone());
        // BAR1 is not implemented on the simulated device.
        assert!(matches!(
            dev.map_with_cmn(1, 4096),
            Err(VsyncError::MapFailed { .. })
        ));
        assert_eq!(dev.state(), DeviceState::Uninit);
        assert_eq!(sim.live_windows(), 0);
    }

    #[test]
    fn cmn_window_is_remapped() {
        let sim = SoftwareDevice::new();
        let mut dev = DeviceHandle::simulated(sim.clone());
        dev.map_with_cmn(2, 4096).unwrap();
        dev.write_cmn_dword(0x40, 9).unwrap();
        assert_eq!(sim.peek_bar(2, 0x40), 9);
        assert_eq!(sim.live_windows(), 2);

        dev.close();
        dev.map().unwrap();
        assert_eq!(dev.read_cmn_dword(0x40).unwrap(), 9);
    }

    #[test]
    fn drop_unmaps() {
        let sim = SoftwareDevice::new();
        {
            let mut dev = DeviceHandle::simulated(sim.clone());
            dev.map().unwrap();
            assert_eq!(sim.live_windows(), 1);
        }
        assert_eq!(sim.live_windows(), 0);
    }
}
