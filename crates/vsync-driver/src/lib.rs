//! Userspace PLL control for Intel DKL display PHYs.
//!
//! Slews the display PLL of Tiger Lake / Alder Lake-P iGPUs through the
//! memory-mapped registers of the display controller, so the local vblank
//! can be locked to a reference system whose clock is shared over PTP.
//!
//! # Layers
//!
//! ```text
//! GenlockLoop   PI control loop, state machine, device recovery
//! ShiftSession  one-shot timed phase shift
//!   OffsetAcquirer   TimeSyncSource -> ClockOffsetSample (or NoSync)
//!   DklCodec         HIP index, PLL fields, stepped retunes, restore
//!     DeviceHandle   open -> map -> use -> close
//!       MmioBackend  sysfs resource mmap | in-memory software registers
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use vsync_driver::{DeviceHandle, DeviceSelector, DklCodec};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut dev = DeviceHandle::open(&DeviceSelector::default())?;
//! dev.map()?;
//!
//! let mut codec = DklCodec::default();
//! for phy in codec.find_enabled_phys(&mut dev)? {
//!     let mhz = codec.select(&mut dev, phy)?.frequency_mhz()?;
//!     println!("PHY {phy}: {mhz:.6} MHz");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Mapping BAR0 needs root (or `CAP_SYS_ADMIN`). Without hardware, build the
//! handle with [`DeviceHandle::simulated`] over a [`SoftwareDevice`].

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod backend;
pub mod backends;
mod codec;
mod config;
mod device;
mod discovery;
mod error;
mod genlock;
pub mod mmio;
mod offset;
mod shift;
pub mod vblank;

/// Hardware identification constants (re-exported from vsync-chip).
pub mod pcie_ids {
    pub use vsync_chip::pcie::{
        is_display_class, Platform, DISPLAY_CLASS, IGPU_ADDRESS, INTEL_VENDOR_ID,
    };
}

pub use backend::{BackendType, MmioBackend};
pub use backends::{SoftwareBackend, SoftwareDevice, SysfsBackend};
pub use codec::{DklCodec, DklRegisters, RetuneConfig, RetuneStatus, SelectedPhy};
pub use config::GenlockConfig;
pub use device::{DeviceHandle, DeviceState};
pub use discovery::{BarInfo, DeviceManager, DeviceSelector, PciDevice, SYSFS_PCI_DEVICES};
pub use error::{Result, VsyncError};
pub use genlock::{
    ControlSnapshot, ControlState, ControllerConfig, CycleOutcome, GenlockLoop, LoopMonitor,
    LoopState,
};
pub use offset::{
    AcquirerConfig, ChannelSource, ClockOffsetSample, OffsetAcquirer, SyncFeed, SyncReading,
    TimeSyncSource,
};
pub use shift::{PhaseShift, ShiftConfig, ShiftDirection, ShiftPhase, ShiftSession};
pub use vsync_chip::dkl::{DklField, DklLayout, DklRegister};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        ChannelSource, ControllerConfig, DeviceHandle, DeviceManager, DeviceSelector, DklCodec,
        DklField, GenlockConfig, GenlockLoop, LoopState, OffsetAcquirer, Result, ShiftConfig,
        ShiftSession, SyncFeed, SyncReading, TimeSyncSource, VsyncError,
    };
}
