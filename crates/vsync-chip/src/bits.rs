//! Bit-field helpers for 32-bit registers.
//!
//! Fields are described as `(shift, width)` pairs rather than `(high, low)`
//! so a width of 32 never needs a special case at the call site.

/// Mask covering `width` bits starting at bit `shift`.
///
/// `width == 0` yields an empty mask. Bits above 31 are discarded.
#[must_use]
pub const fn field_mask(shift: u32, width: u32) -> u32 {
    if width == 0 || shift >= 32 {
        return 0;
    }
    let ones = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
    ones << shift
}

/// Equivalent of the kernel's `GENMASK(h, l)` for 32-bit registers.
#[must_use]
pub const fn genmask(high: u32, low: u32) -> u32 {
    field_mask(low, high - low + 1)
}

/// Largest value a field of `width` bits can hold.
#[must_use]
pub const fn field_max(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Extract the field at `(shift, width)` from `value`.
#[must_use]
pub const fn extract(value: u32, shift: u32, width: u32) -> u32 {
    (value & field_mask(shift, width)) >> shift
}

/// Replace the field at `(shift, width)` in `value` with `field`.
///
/// Bits of `field` that do not fit are dropped; callers that must not
/// truncate check [`fits`] first.
#[must_use]
pub const fn insert(value: u32, field: u32, shift: u32, width: u32) -> u32 {
    let mask = field_mask(shift, width);
    (value & !mask) | ((field << shift) & mask)
}

/// Whether `value` fits in a field of `width` bits.
#[must_use]
pub const fn fits(value: u64, width: u32) -> bool {
    value <= field_max(width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genmask_matches_kernel_definition() {
        assert_eq!(genmask(7, 0), 0xFF);
        assert_eq!(genmask(11, 8), 0xF00);
        assert_eq!(genmask(29, 8), 0x3FFF_FF00);
        assert_eq!(genmask(31, 29), 0xE000_0000);
        assert_eq!(genmask(31, 0), u32::MAX);
    }

    #[test]
    fn insert_preserves_neighbouring_bits() {
        let reg = 0x5028_4274;
        let updated = insert(reg, 0x80, 0, 8);
        assert_eq!(updated, 0x5028_4280);
        assert_eq!(extract(updated, 8, 4), extract(reg, 8, 4));
    }

    #[test]
    fn fits_respects_width() {
        assert!(fits(255, 8));
        assert!(!fits(256, 8));
        assert!(fits(1, 1));
        assert!(!fits(2, 1));
        assert!(fits(u64::from(u32::MAX), 32));
    }

    #[test]
    fn zero_width_field_is_empty() {
        assert_eq!(field_mask(4, 0), 0);
        assert_eq!(insert(0xFFFF_FFFF, 0xF, 4, 0), 0xFFFF_FFFF);
    }
}
