//! Silicon model for the display PHY clock path used by software genlock.
//!
//! This crate has **no dependencies** and **no hardware access**. It models
//! the pieces of an Intel display controller that genlock touches: PCI
//! identifiers, the MMIO BAR window, the DKL PHY register map with its HIP
//! index banking, the PLL field layouts and the PLL frequency arithmetic.
//!
//! Register offsets follow the i915 display register definitions for
//! Tiger Lake and Alder Lake-P Type-C PHYs.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device IDs, display class, platform identification |
//! | [`bar`] | Register BAR index and mapping window size |
//! | [`dkl`] | DKL PHY register map, HIP index composition, field layouts, PLL math |
//! | [`bits`] | Bit-field helpers shared by the codec |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod bits;
pub mod dkl;
pub mod pcie;
