//! PCI BAR layout for the integrated display controller.
//!
//! ```text
//! BAR  Purpose                         Mapped by genlock
//! ──── ─────────────────────────────── ─────────────────────────
//!  0   GTTMMADR: MMIO registers + GTT  first 2 MiB (display MMIO)
//!  2   GMADR: graphics aperture        optional "cmn" window
//!  6   Expansion ROM                   never
//! ```
//!
//! All display registers genlock programs (DKL PHYs at `0x168000+`, HIP index
//! registers at `0x1010A0`) sit inside the first 2 MiB of BAR0.

/// Number of standard BARs in a type-0 PCI header.
pub const BAR_COUNT: usize = 6;

/// BAR index carrying the MMIO register space.
pub const MMIO_BAR: usize = 0;

/// Size of the MMIO register window that is mapped.
pub const MMIO_SIZE: usize = 2 * 1024 * 1024;

/// Register width in bytes. Every access is one aligned dword.
pub const DWORD: usize = 4;

/// Whether an access of one dword at `offset` fits a window of `size` bytes.
#[must_use]
pub const fn dword_in_window(offset: usize, size: usize) -> bool {
    offset % DWORD == 0 && offset <= size && size - offset >= DWORD
}
