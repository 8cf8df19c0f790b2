//! DKL Type-C PHY register map and PLL arithmetic.
//!
//! ```text
//! 0x1010A0  HIP_INDEX_REG0   byte n selects the bank for PHY n   (n = 0..3)
//! 0x1010A4  HIP_INDEX_REG1   byte n-4 selects the bank for PHY n (n = 4..5)
//!
//! 0x168000 + n * 0x1000      PHY n window (bank 2 = PLL registers)
//!   +0x200  DKL_PLL_DIV0          [11:8] fb prediv, [7:0] fb divider integer
//!   +0x210  DKL_SSC               [31:29] iref ndiv ratio, [13] ssc enable
//!   +0x214  DKL_BIAS              [29:8] fb divider fraction (22 bits)
//!   +0x220  DKL_VISA_SERIALIZER   [2:0] align
//!   +0x224  DKL_DCO               [2] dco amp override
//! ```
//!
//! PLL output frequency:
//!
//! ```text
//! f = 38.4 MHz * prediv * (int + frac / 2^22)
//! ```
//!
//! The fraction scale follows the width of the `fbdivfrac` field, so a
//! layout override with a narrower fraction keeps the arithmetic exact.

use crate::bits;
use std::fmt;

/// DKL PLL reference clock in MHz.
pub const REF_FREQ_MHZ: f64 = 38.4;

/// Base of the first DKL PHY window.
pub const PHY_BASE: usize = 0x0016_8000;

/// Distance between consecutive PHY windows.
pub const PHY_STRIDE: usize = 0x1000;

/// Number of DKL PHY instances addressable through the HIP index registers.
pub const MAX_PHYS: usize = 6;

/// HIP index register for PHYs 0–3.
pub const HIP_INDEX_REG0: usize = 0x0010_10A0;

/// HIP index register for PHYs 4–5.
pub const HIP_INDEX_REG1: usize = 0x0010_10A4;

/// HIP bank holding the PLL registers.
pub const PLL_BANK: u32 = 0x2;

/// Width of each PHY's bank selector inside a HIP index register.
pub const HIP_INDEX_WIDTH: u32 = 8;

/// Number of fractional bits in the feedback divider.
pub const FBDIV_FRAC_BITS: u32 = 22;

/// Offsets of the PLL registers inside a PHY window.
pub mod offset {
    /// PLL divider 0.
    pub const PLL_DIV0: usize = 0x200;
    /// Spread-spectrum clocking control.
    pub const SSC: usize = 0x210;
    /// Bias / fractional feedback divider.
    pub const BIAS: usize = 0x214;
    /// VISA serializer control.
    pub const VISA_SERIALIZER: usize = 0x220;
    /// DCO control.
    pub const DCO: usize = 0x224;
}

/// Base of PHY `phy`'s register window (`PHY_NUM_BASE`).
#[must_use]
pub const fn phy_num_base(phy: usize) -> usize {
    PHY_BASE + phy * PHY_STRIDE
}

/// HIP index register holding PHY `phy`'s bank selector (`HIP_INDEX_REG`).
#[must_use]
pub const fn hip_index_reg(phy: usize) -> usize {
    if phy < 4 {
        HIP_INDEX_REG0
    } else {
        HIP_INDEX_REG1
    }
}

/// Bit position of PHY `phy`'s bank selector (`_HIP_INDEX_SHIFT`).
#[must_use]
pub const fn hip_index_shift(phy: usize) -> u32 {
    8 * (phy % 4) as u32
}

/// Bank selector value for PHY `phy` (`HIP_INDEX_VAL`).
#[must_use]
pub const fn hip_index_val(phy: usize, bank: u32) -> u32 {
    bank << hip_index_shift(phy)
}

/// The five PLL registers genlock programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DklRegister {
    /// `DKL_PLL_DIV0`
    PllDiv0,
    /// `DKL_VISA_SERIALIZER`
    VisaSerializer,
    /// `DKL_BIAS`
    Bias,
    /// `DKL_SSC`
    Ssc,
    /// `DKL_DCO`
    Dco,
}

impl DklRegister {
    /// All registers in programming order.
    pub const ALL: [Self; 5] = [
        Self::PllDiv0,
        Self::VisaSerializer,
        Self::Bias,
        Self::Ssc,
        Self::Dco,
    ];

    /// Offset inside a PHY window.
    #[must_use]
    pub const fn offset(self) -> usize {
        match self {
            Self::PllDiv0 => offset::PLL_DIV0,
            Self::VisaSerializer => offset::VISA_SERIALIZER,
            Self::Bias => offset::BIAS,
            Self::Ssc => offset::SSC,
            Self::Dco => offset::DCO,
        }
    }

    /// Absolute MMIO offset for PHY `phy`.
    #[must_use]
    pub const fn address(self, phy: usize) -> usize {
        phy_num_base(phy) + self.offset()
    }

    /// Register name as it appears in the register manual.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PllDiv0 => "DKL_PLL_DIV0",
            Self::VisaSerializer => "DKL_VISA_SERIALIZER",
            Self::Bias => "DKL_BIAS",
            Self::Ssc => "DKL_SSC",
            Self::Dco => "DKL_DCO",
        }
    }
}

/// Semantic PLL fields reachable through the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DklField {
    /// Feedback divider integer part.
    Divider,
    /// Feedback pre-divider.
    Prediv,
    /// Feedback divider fractional part (lives in the bias register).
    Bias,
    /// Spread-spectrum IREF ndiv ratio.
    SpreadSpectrum,
    /// Spread-spectrum enable.
    SscEnable,
    /// VISA serializer alignment.
    VisaSerializer,
    /// DCO amplitude override.
    Dco,
}

impl DklField {
    /// All fields.
    pub const ALL: [Self; 7] = [
        Self::Divider,
        Self::Prediv,
        Self::Bias,
        Self::SpreadSpectrum,
        Self::SscEnable,
        Self::VisaSerializer,
        Self::Dco,
    ];

    /// Field name used in errors and register dumps.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Divider => "fbdiv_intgr",
            Self::Prediv => "fbprediv",
            Self::Bias => "fbdivfrac",
            Self::SpreadSpectrum => "ssc_iref_ndiv_ratio",
            Self::SscEnable => "ssc_en",
            Self::VisaSerializer => "visa_serializer_align",
            Self::Dco => "dco_amp_ovrd_en",
        }
    }
}

impl fmt::Display for DklField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Placement of a field inside one of the PLL registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    /// Register holding the field.
    pub register: DklRegister,
    /// Lowest bit of the field.
    pub shift: u32,
    /// Number of bits.
    pub width: u32,
}

impl FieldLayout {
    /// Create a layout entry.
    #[must_use]
    pub const fn new(register: DklRegister, shift: u32, width: u32) -> Self {
        Self {
            register,
            shift,
            width,
        }
    }

    /// Mask of the field inside its register.
    #[must_use]
    pub const fn mask(&self) -> u32 {
        bits::field_mask(self.shift, self.width)
    }

    /// Extract the field from a raw register value.
    #[must_use]
    pub const fn extract(&self, raw: u32) -> u32 {
        bits::extract(raw, self.shift, self.width)
    }

    /// Insert `value` into a raw register value. Oversized values are
    /// truncated, so check [`FieldLayout::fits`] first.
    #[must_use]
    pub const fn insert(&self, raw: u32, value: u32) -> u32 {
        bits::insert(raw, value, self.shift, self.width)
    }

    /// Whether `value` fits the field.
    #[must_use]
    pub const fn fits(&self, value: u64) -> bool {
        bits::fits(value, self.width)
    }

    /// Whether the field lies entirely within 32 bits.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.width > 0 && self.width <= 32 && self.shift <= 32 - self.width
    }
}

/// Bit layout of every [`DklField`].
///
/// The defaults mirror the i915 DKL definitions. They are carried as a
/// value so a platform with a different layout can be described in
/// configuration instead of code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DklLayout {
    /// `DKL_PLL_DIV0[7:0]`
    pub divider: FieldLayout,
    /// `DKL_PLL_DIV0[11:8]`
    pub prediv: FieldLayout,
    /// `DKL_BIAS[29:8]`
    pub bias: FieldLayout,
    /// `DKL_SSC[31:29]`
    pub spread_spectrum: FieldLayout,
    /// `DKL_SSC[13]`
    pub ssc_enable: FieldLayout,
    /// `DKL_VISA_SERIALIZER[2:0]`
    pub visa_serializer: FieldLayout,
    /// `DKL_DCO[2]`
    pub dco: FieldLayout,
}

impl Default for DklLayout {
    fn default() -> Self {
        Self {
            divider: FieldLayout::new(DklRegister::PllDiv0, 0, 8),
            prediv: FieldLayout::new(DklRegister::PllDiv0, 8, 4),
            bias: FieldLayout::new(DklRegister::Bias, 8, FBDIV_FRAC_BITS),
            spread_spectrum: FieldLayout::new(DklRegister::Ssc, 29, 3),
            ssc_enable: FieldLayout::new(DklRegister::Ssc, 13, 1),
            visa_serializer: FieldLayout::new(DklRegister::VisaSerializer, 0, 3),
            dco: FieldLayout::new(DklRegister::Dco, 2, 1),
        }
    }
}

impl DklLayout {
    /// Layout entry for `field`.
    #[must_use]
    pub const fn field(&self, field: DklField) -> FieldLayout {
        match field {
            DklField::Divider => self.divider,
            DklField::Prediv => self.prediv,
            DklField::Bias => self.bias,
            DklField::SpreadSpectrum => self.spread_spectrum,
            DklField::SscEnable => self.ssc_enable,
            DklField::VisaSerializer => self.visa_serializer,
            DklField::Dco => self.dco,
        }
    }

    /// Mutable layout entry for `field`.
    pub fn field_mut(&mut self, field: DklField) -> &mut FieldLayout {
        match field {
            DklField::Divider => &mut self.divider,
            DklField::Prediv => &mut self.prediv,
            DklField::Bias => &mut self.bias,
            DklField::SpreadSpectrum => &mut self.spread_spectrum,
            DklField::SscEnable => &mut self.ssc_enable,
            DklField::VisaSerializer => &mut self.visa_serializer,
            DklField::Dco => &mut self.dco,
        }
    }

    /// Fields living in `register`, in bit order.
    #[must_use]
    pub fn fields_of(&self, register: DklRegister) -> Vec<(DklField, FieldLayout)> {
        let mut out: Vec<_> = DklField::ALL
            .iter()
            .map(|&f| (f, self.field(f)))
            .filter(|(_, l)| l.register == register)
            .collect();
        out.sort_by_key(|(_, l)| l.shift);
        out
    }

    /// First field whose layout does not fit a 32-bit register, if any.
    #[must_use]
    pub fn first_invalid(&self) -> Option<DklField> {
        DklField::ALL.into_iter().find(|&f| !self.field(f).is_valid())
    }

    /// First pair of fields sharing bits of the same register, if any.
    #[must_use]
    pub fn first_overlap(&self) -> Option<(DklField, DklField)> {
        for (i, &a) in DklField::ALL.iter().enumerate() {
            for &b in &DklField::ALL[i + 1..] {
                let (la, lb) = (self.field(a), self.field(b));
                if la.register == lb.register && la.mask() & lb.mask() != 0 {
                    return Some((a, b));
                }
            }
        }
        None
    }
}

/// Bits written on the first retune of a PHY, on top of the divider change.
///
/// These switch the PLL into the mode used while a
/// fractional retune is active; restoring the saved registers clears them.
pub mod profile {
    /// `DKL_SSC[31:29]` value.
    pub const SSC_IREF_NDIV_RATIO: u32 = 0x2;
    /// `DKL_SSC[13]` value.
    pub const SSC_ENABLE: u32 = 0x1;
    /// `DKL_VISA_SERIALIZER[2:0]` value.
    pub const VISA_SERIALIZER_ALIGN: u32 = 0x0;
    /// Extra bit set in `DKL_VISA_SERIALIZER`.
    pub const VISA_SERIALIZER_EXTRA: u32 = 1 << 9;
    /// `DKL_DCO[2]` value.
    pub const DCO_AMP_OVRD_EN: u32 = 0x1;
}

/// PLL arithmetic failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PllError {
    /// Pre-divider of zero; the PLL is not configured.
    ZeroPrediv,
    /// Target frequency is zero, negative or not finite.
    InvalidTarget(f64),
    /// A divider value does not fit its field.
    Overflow {
        /// Field that overflowed
        field: DklField,
        /// Rejected value
        value: u64,
        /// Field width in bits
        width: u32,
    },
    /// Fraction computed for a different `fbdivfrac` width.
    FractionScale {
        /// Fraction bits of the dividers
        bits: u32,
        /// Width of the layout's fraction field
        width: u32,
    },
}

impl fmt::Display for PllError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroPrediv => write!(f, "feedback pre-divider is zero"),
            Self::InvalidTarget(t) => write!(f, "invalid target frequency {t} MHz"),
            Self::Overflow {
                field,
                value,
                width,
            } => write!(f, "{field} value {value:#x} does not fit {width} bits"),
            Self::FractionScale { bits, width } => write!(
                f,
                "fraction has {bits} bits but the fbdivfrac field is {width} wide"
            ),
        }
    }
}

impl std::error::Error for PllError {}

/// Feedback divider settings of one PLL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PllDividers {
    /// Feedback pre-divider.
    pub prediv: u32,
    /// Feedback divider integer part.
    pub integer: u32,
    /// Feedback divider fraction in units of `2^-frac_bits`.
    pub fraction: u32,
    /// Number of fraction bits (the `fbdivfrac` field width).
    pub frac_bits: u32,
}

impl PllDividers {
    /// Decode from raw `DKL_PLL_DIV0` and `DKL_BIAS` values.
    #[must_use]
    pub const fn from_registers(layout: &DklLayout, pll_div0: u32, bias: u32) -> Self {
        Self {
            prediv: layout.prediv.extract(pll_div0),
            integer: layout.divider.extract(pll_div0),
            fraction: layout.bias.extract(bias),
            frac_bits: layout.bias.width,
        }
    }

    /// Feedback ratio `int + frac / 2^frac_bits`.
    #[must_use]
    pub fn ratio(&self) -> f64 {
        f64::from(self.integer) + f64::from(self.fraction) / frac_scale(self.frac_bits)
    }

    /// PLL output frequency in MHz.
    #[must_use]
    pub fn frequency_mhz(&self) -> f64 {
        REF_FREQ_MHZ * f64::from(self.prediv) * self.ratio()
    }

    /// Dividers producing `target_mhz` with the given pre-divider, sized
    /// for `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`PllError`] if the pre-divider is zero, the target is not a
    /// positive finite frequency, or a value does not fit its field.
    pub fn for_frequency(
        target_mhz: f64,
        prediv: u32,
        layout: &DklLayout,
    ) -> Result<Self, PllError> {
        if prediv == 0 {
            return Err(PllError::ZeroPrediv);
        }
        if !target_mhz.is_finite() || target_mhz <= 0.0 {
            return Err(PllError::InvalidTarget(target_mhz));
        }
        check_fits(layout, DklField::Prediv, u64::from(prediv))?;

        let frac_bits = layout.bias.width;
        let scale = frac_scale(frac_bits);
        let ratio = target_mhz / (REF_FREQ_MHZ * f64::from(prediv));
        let mut integer = ratio.floor();
        let mut fraction = ((ratio - integer) * scale).round();
        // Rounding can carry a full unit into the integer part.
        if fraction >= scale {
            integer += 1.0;
            fraction -= scale;
        }

        // Both values are non-negative and finite here.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (integer, fraction) = (integer as u64, fraction as u64);
        check_fits(layout, DklField::Divider, integer)?;
        check_fits(layout, DklField::Bias, fraction)?;

        // Both fit fields of at most 32 bits.
        #[allow(clippy::cast_possible_truncation)]
        let (integer, fraction) = (integer as u32, fraction as u32);
        Ok(Self {
            prediv,
            integer,
            fraction,
            frac_bits,
        })
    }

    /// Write the dividers into raw `DKL_PLL_DIV0` / `DKL_BIAS` values.
    ///
    /// # Errors
    ///
    /// Returns [`PllError::Overflow`] if a value does not fit its field and
    /// [`PllError::FractionScale`] if the fraction was computed for another
    /// `fbdivfrac` width. The raw values are not touched on error.
    pub fn apply(
        &self,
        layout: &DklLayout,
        pll_div0: u32,
        bias: u32,
    ) -> Result<(u32, u32), PllError> {
        if self.frac_bits != layout.bias.width {
            return Err(PllError::FractionScale {
                bits: self.frac_bits,
                width: layout.bias.width,
            });
        }
        check_fits(layout, DklField::Divider, u64::from(self.integer))?;
        check_fits(layout, DklField::Prediv, u64::from(self.prediv))?;
        check_fits(layout, DklField::Bias, u64::from(self.fraction))?;

        let div0 = layout.divider.insert(pll_div0, self.integer);
        let div0 = layout.prediv.insert(div0, self.prediv);
        Ok((div0, layout.bias.insert(bias, self.fraction)))
    }
}

fn check_fits(layout: &DklLayout, field: DklField, value: u64) -> Result<(), PllError> {
    let fl = layout.field(field);
    if fl.fits(value) {
        Ok(())
    } else {
        Err(PllError::Overflow {
            field,
            value,
            width: fl.width,
        })
    }
}

// Exact in f64 for any field width up to 32.
#[allow(clippy::cast_precision_loss)]
fn frac_scale(bits: u32) -> f64 {
    1u64.checked_shl(bits).unwrap_or(u64::MAX) as f64
}
