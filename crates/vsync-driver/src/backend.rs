//! Backend abstraction for register mapping
//!
//! A backend turns a discovered [`PciDevice`] BAR into a [`RegisterWindow`].
//! The sysfs backend maps real hardware; the software backend serves an
//! in-memory register file so the full genlock stack runs in CI.

use crate::discovery::PciDevice;
use crate::error::Result;
use crate::mmio::RegisterWindow;
use std::fmt::Debug;

/// Register mapping backend
pub trait MmioBackend: Debug + Send {
    /// Map `len` bytes of BAR `bar` of `device`
    ///
    /// # Errors
    ///
    /// Returns `MapFailed` if the BAR cannot be mapped with that size.
    fn map_window(
        &mut self,
        device: &PciDevice,
        bar: usize,
        len: usize,
    ) -> Result<Box<dyn RegisterWindow>>;

    /// Get backend type for debugging
    fn backend_type(&self) -> BackendType;
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// mmap of `/sys/bus/pci/devices/<addr>/resourceN`
    Sysfs,

    /// In-memory register file, no hardware required
    Software,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sysfs => write!(f, "sysfs"),
            Self::Software => write!(f, "software"),
        }
    }
}
