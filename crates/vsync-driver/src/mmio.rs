//! Memory-mapped register windows
//!
//! A [`RegisterWindow`] is one mapped BAR range. Every access is a single,
//! aligned, bounds-checked dword and nothing is cached: display registers
//! may change underneath us or clear on read.
//!
//! [`MmapRegion`] maps a sysfs `resourceN` file through `rustix`. All unsafe
//! code of the driver lives in this file.

use crate::error::{Result, VsyncError};
use rustix::fs::OFlags;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use vsync_chip::bar;

/// A mapped, dword-addressable register window
pub trait RegisterWindow: Debug + Send + Sync {
    /// Window size in bytes
    fn size(&self) -> usize;

    /// BAR index this window was mapped from
    fn bar_index(&self) -> usize;

    /// Read a 32-bit register
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if the dword does not fit the window, or
    /// `NotMapped` if the mapping was revoked.
    fn read_u32(&self, offset: usize) -> Result<u32>;

    /// Write a 32-bit register
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if the dword does not fit the window, or
    /// `NotMapped` if the mapping was revoked.
    fn write_u32(&mut self, offset: usize, value: u32) -> Result<()>;
}

/// Validate a dword access against a window of `size` bytes.
///
/// # Errors
///
/// Returns `OutOfRange` for unaligned offsets or when `offset + 4 > size`.
pub fn check_dword(offset: usize, size: usize) -> Result<()> {
    if bar::dword_in_window(offset, size) {
        Ok(())
    } else {
        Err(VsyncError::OutOfRange {
            offset,
            limit: size,
        })
    }
}

/// Memory-mapped PCI BAR region backed by a sysfs resource file
///
/// The resource file stays open for the lifetime of the mapping and the
/// mapping is released in `Drop`.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    path: PathBuf,
    bar_index: usize,
}

impl MmapRegion {
    /// Map the first `len` bytes of a `resourceN` file
    ///
    /// # Errors
    ///
    /// Returns `MapFailed` if the file cannot be opened, the BAR is empty,
    /// `len` is zero or larger than the BAR, or `mmap` fails.
    pub fn new(resource: &Path, bar_index: usize, len: usize) -> Result<Self> {
        tracing::debug!("Mapping {} ({len:#x} bytes)", resource.display());

        // O_SYNC bits are small positive values
        #[allow(clippy::cast_possible_wrap)]
        let sync_flag = OFlags::SYNC.bits() as i32;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(sync_flag)
            .open(resource)
            .map_err(|e| {
                VsyncError::map_failed(format!(
                    "cannot open {}: {e} (root and an enabled device are required)",
                    resource.display()
                ))
            })?;

        let bar_size = file
            .metadata()
            .map_err(|e| VsyncError::map_failed(format!("cannot stat BAR{bar_index}: {e}")))?
            .len();

        if bar_size == 0 {
            return Err(VsyncError::map_failed(format!(
                "BAR{bar_index} has size 0 (device disabled?)"
            )));
        }
        if len == 0 || len as u64 > bar_size {
            return Err(VsyncError::map_failed(format!(
                "requested {len:#x} bytes but BAR{bar_index} is {bar_size:#x} bytes"
            )));
        }

        // SAFETY: the fd was just opened read/write and is kept alive in the
        // returned struct; len is non-zero and no larger than the BAR; the
        // kernel picks the address, so no existing mapping is replaced.
        // MAP_SHARED is required for device memory.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| VsyncError::map_failed(format!("mmap of BAR{bar_index} failed: {e}")))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| VsyncError::map_failed("mmap returned a null mapping"))?;

        tracing::info!(
            "Mapped BAR{bar_index} ({} KiB of {} KiB) at {ptr:p}",
            len / 1024,
            bar_size / 1024
        );

        Ok(Self {
            ptr,
            size: len,
            _file: file,
            path: resource.to_path_buf(),
            bar_index,
        })
    }

    /// Resource file backing this mapping
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegisterWindow for MmapRegion {
    fn size(&self) -> usize {
        self.size
    }

    fn bar_index(&self) -> usize {
        self.bar_index
    }

    fn read_u32(&self, offset: usize) -> Result<u32> {
        check_dword(offset, self.size)?;

        // SAFETY: check_dword guarantees offset is dword aligned and
        // offset + 4 <= size, so the pointer stays inside the live mapping.
        // Volatile because MMIO reads have side effects and must not be
        // merged or reordered by the compiler.
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };

        tracing::trace!("BAR{} read {offset:#x} = {value:#010x}", self.bar_index);
        Ok(value)
    }

    fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        check_dword(offset, self.size)?;

        tracing::trace!("BAR{} write {offset:#x} = {value:#010x}", self.bar_index);

        // SAFETY: same bounds and alignment argument as read_u32. &mut self
        // gives exclusive access for the write.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }
        Ok(())
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        tracing::debug!("Unmapping BAR{} ({})", self.bar_index, self.path.display());

        // SAFETY: ptr and size are exactly what mmap returned and was given
        // in new(); the mapping is unmapped only here.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: the region exclusively owns its mapping, which stays valid for the
// life of the value regardless of the thread it is used from.
unsafe impl Send for MmapRegion {}

// SAFETY: shared access only performs bounds-checked volatile reads; writes
// require &mut self.
unsafe impl Sync for MmapRegion {}
