//! Register mapping backends
//!
//! - **Sysfs**: mmap of the PCI `resourceN` files (needs root)
//! - **Software**: in-memory register file with fault injection, for CI

pub mod software;
pub mod sysfs;

pub use software::{SoftwareBackend, SoftwareDevice};
pub use sysfs::SysfsBackend;
