//! Error types for genlock driver operations

use thiserror::Error;

/// Result type alias for genlock operations
pub type Result<T> = std::result::Result<T, VsyncError>;

/// Errors that can occur during genlock operations
#[derive(Debug, Error)]
pub enum VsyncError {
    /// No PCI device matched the selector
    #[error("No display device matches {selector}")]
    DeviceNotFound {
        /// Human-readable selector description
        selector: String,
    },

    /// Device matched but is not a DKL-capable display controller
    #[error("Unsupported device {vendor_id:04x}:{device_id:04x} (class {class_code:06x}): {reason}")]
    UnsupportedDevice {
        /// PCI vendor ID
        vendor_id: u16,
        /// PCI device ID
        device_id: u16,
        /// 24-bit PCI class code
        class_code: u32,
        /// Why the device was rejected
        reason: String,
    },

    /// `map` called on a handle that is already mapped
    #[error("Device registers are already mapped")]
    AlreadyMapped,

    /// Hardware access attempted without a live mapping
    #[error("Device registers are not mapped")]
    NotMapped,

    /// The mapping primitive failed
    #[error("Failed to map registers: {reason}")]
    MapFailed {
        /// Reason for failure
        reason: String,
    },

    /// Register access outside the mapped window
    #[error("Register offset {offset:#x} out of range (window {limit:#x} bytes)")]
    OutOfRange {
        /// Requested offset
        offset: usize,
        /// Window size in bytes
        limit: usize,
    },

    /// PHY index out of range
    #[error("PHY index {index} out of range (have {count} PHYs)")]
    InvalidIndex {
        /// Requested index
        index: usize,
        /// Number of addressable PHYs
        count: usize,
    },

    /// A previous PLL operation on this PHY is still in flight
    #[error("PHY {phy} has an operation in flight")]
    OperationPending {
        /// PHY index
        phy: usize,
    },

    /// Value does not fit the target field
    #[error("Value {value:#x} does not fit {field} ({width} bits)")]
    ValueOutOfRange {
        /// Field name
        field: &'static str,
        /// Rejected value
        value: u64,
        /// Field width in bits
        width: u32,
    },

    /// Time-sync source is not synchronized, stale or timed out
    #[error("No time synchronization: {reason}")]
    NoSync {
        /// Reason reported or detected
        reason: String,
    },

    /// Device kept failing after bounded retries
    #[error("Device lost after {attempts} failed recovery attempts")]
    DeviceLost {
        /// Consecutive failed attempts
        attempts: u32,
    },

    /// PLL divider state cannot be used for frequency math
    #[error("Invalid PLL dividers: {reason}")]
    InvalidDividers {
        /// Reason for failure
        reason: String,
    },

    /// Configuration value rejected
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Reason for failure
        reason: String,
    },

    /// I/O error during discovery or mapping
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl VsyncError {
    /// Create a device not found error
    pub fn device_not_found(selector: impl Into<String>) -> Self {
        Self::DeviceNotFound {
            selector: selector.into(),
        }
    }

    /// Create a map failed error
    pub fn map_failed(reason: impl Into<String>) -> Self {
        Self::MapFailed {
            reason: reason.into(),
        }
    }

    /// Create a no-sync error
    pub fn no_sync(reason: impl Into<String>) -> Self {
        Self::NoSync {
            reason: reason.into(),
        }
    }

    /// Create an invalid dividers error
    pub fn invalid_dividers(reason: impl Into<String>) -> Self {
        Self::InvalidDividers {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Conditions the control loop retries on its next cycle
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::OperationPending { .. } | Self::NoSync { .. })
    }

    /// Conditions that indicate the mapping itself is gone or unusable
    #[must_use]
    pub const fn is_device_failure(&self) -> bool {
        matches!(self, Self::NotMapped | Self::MapFailed { .. })
    }

    /// Structural misuse that must reach the caller unretried
    #[must_use]
    pub const fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidIndex { .. }
                | Self::ValueOutOfRange { .. }
                | Self::OutOfRange { .. }
                | Self::AlreadyMapped
                | Self::InvalidConfig { .. }
        )
    }
}
