//! Sysfs resource-file backend

use crate::backend::{BackendType, MmioBackend};
use crate::discovery::PciDevice;
use crate::error::{Result, VsyncError};
use crate::mmio::{MmapRegion, RegisterWindow};
use vsync_chip::bar::BAR_COUNT;

/// Maps BARs through `/sys/bus/pci/devices/<addr>/resourceN`
#[derive(Debug, Default, Clone, Copy)]
pub struct SysfsBackend;

impl SysfsBackend {
    /// Create the backend
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl MmioBackend for SysfsBackend {
    fn map_window(
        &mut self,
        device: &PciDevice,
        bar: usize,
        len: usize,
    ) -> Result<Box<dyn RegisterWindow>> {
        if bar >= BAR_COUNT {
            return Err(VsyncError::map_failed(format!("no BAR{bar} on a type-0 header")));
        }
        let info = device.bars[bar];
        if info.is_present() && len as u64 > info.size {
            return Err(VsyncError::map_failed(format!(
                "BAR{bar} of {} is {:#x} bytes, {len:#x} requested",
                device.address, info.size
            )));
        }
        let region = MmapRegion::new(&device.resource_path(bar), bar, len)?;
        Ok(Box::new(region))
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Sysfs
    }
}
