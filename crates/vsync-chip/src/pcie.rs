//! PCI identifiers for supported display controllers.
//!
//! Device IDs come from the i915 `i915_pciids.h` tables.

/// Intel vendor ID (PCI-SIG assigned).
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// PCI base class for display controllers.
pub const DISPLAY_CLASS: u8 = 0x03;

/// Conventional PCI address of the integrated graphics function.
pub const IGPU_ADDRESS: &str = "0000:00:02.0";

/// Tiger Lake device IDs.
pub const TGL_IDS: &[u16] = &[
    0x9A60, 0x9A68, 0x9A70, 0x9A40, 0x9A49, 0x9A59, 0x9A78, 0x9AC0, 0x9AC9, 0x9AD9, 0x9AF8,
];

/// Alder Lake-P device IDs, including Raptor Lake-P/H parts that share the
/// Alder Lake-P display block.
pub const ADL_P_IDS: &[u16] = &[
    0x46A0, 0x46A1, 0x46A2, 0x46A3, 0x46A6, 0x46A8, 0x46AA, 0x462A, 0x4626, 0x4628, 0x46B0,
    0x46B1, 0x46B2, 0x46B3, 0x46C0, 0x46C1, 0x46C2, 0x46C3, 0xA7A0, 0xA7A8, 0xA788, 0xA78B,
];

/// Alder Lake-S / Raptor Lake-S device IDs (combo PHYs only).
pub const ADL_S_IDS: &[u16] = &[
    0x4680, 0x4682, 0x4688, 0x468A, 0x468B, 0x4690, 0x4692, 0x4693, 0xA780, 0xA782, 0xA783,
];

/// Meteor Lake / Arrow Lake-P device IDs (C10/C20 PHYs).
pub const MTL_IDS: &[u16] = &[
    0x7D40, 0x7D41, 0x7D60, 0x7D67, 0x7D45, 0x7D55, 0x7DD5, 0x7D51, 0x7DD1,
];

/// Display platform identified at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Tiger Lake: combo PHYs A–C, DKL Type-C PHYs TC1–TC6.
    TigerLake,
    /// Alder Lake-P family: combo PHYs A–B, DKL Type-C PHYs TC1–TC4.
    AlderLakeP,
    /// Alder Lake-S family: combo PHYs only.
    AlderLakeS,
    /// Meteor Lake family: C10/C20 PHYs.
    MeteorLake,
    /// Any other device ID.
    Unknown(u16),
}

impl Platform {
    /// Identify the platform from a PCI device ID.
    ///
    /// Tiger Lake and Alder Lake-P are checked before Alder Lake-S because
    /// the i915 ID tables list a few Raptor Lake IDs under several families.
    #[must_use]
    pub fn from_device_id(id: u16) -> Self {
        if TGL_IDS.contains(&id) {
            Self::TigerLake
        } else if ADL_P_IDS.contains(&id) {
            Self::AlderLakeP
        } else if ADL_S_IDS.contains(&id) {
            Self::AlderLakeS
        } else if MTL_IDS.contains(&id) {
            Self::MeteorLake
        } else {
            Self::Unknown(id)
        }
    }

    /// Whether the platform carries DKL Type-C PHYs.
    #[must_use]
    pub const fn has_dkl_phys(&self) -> bool {
        matches!(self, Self::TigerLake | Self::AlderLakeP)
    }

    /// Number of DKL PHY instances wired on this platform.
    #[must_use]
    pub const fn dkl_phy_count(&self) -> usize {
        match self {
            Self::TigerLake => 6,
            Self::AlderLakeP => 4,
            Self::AlderLakeS | Self::MeteorLake | Self::Unknown(_) => 0,
        }
    }

    /// Short platform name used in logs and the CLI.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TigerLake => "TGL",
            Self::AlderLakeP => "ADL-P",
            Self::AlderLakeS => "ADL-S",
            Self::MeteorLake => "MTL",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Whether a 24-bit PCI class code describes a display controller.
#[must_use]
pub const fn is_display_class(class_code: u32) -> bool {
    (class_code >> 16) as u8 == DISPLAY_CLASS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiger_lake_is_dkl_capable() {
        let p = Platform::from_device_id(0x9A49);
        assert_eq!(p, Platform::TigerLake);
        assert!(p.has_dkl_phys());
        assert_eq!(p.dkl_phy_count(), 6);
    }

    #[test]
    fn combo_only_platforms_are_not_dkl_capable() {
        assert!(!Platform::from_device_id(0x4680).has_dkl_phys());
        assert!(!Platform::from_device_id(0x7D55).has_dkl_phys());
        assert!(!Platform::from_device_id(0x1234).has_dkl_phys());
    }

    #[test]
    fn raptor_lake_p_shares_alder_lake_p_display() {
        assert_eq!(Platform::from_device_id(0xA7A0), Platform::AlderLakeP);
    }

    #[test]
    fn display_class_decoding() {
        assert!(is_display_class(0x03_0000));
        assert!(is_display_class(0x03_8000));
        assert!(!is_display_class(0x02_0000));
    }
}
