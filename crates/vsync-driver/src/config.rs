//! Runtime configuration
//!
//! [`GenlockConfig`] gathers every tunable of the driver. Defaults are
//! usable as is; `VSYNC_*` environment variables override single values:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `VSYNC_KP`, `VSYNC_KI` | controller gains |
//! | `VSYNC_MAX_CORRECTION_PPM`, `VSYNC_DEADBAND_PPM` | correction bounds |
//! | `VSYNC_TOLERANCE_NS`, `VSYNC_TARGET_OFFSET_NS` | lock window |
//! | `VSYNC_LOCK_SAMPLES`, `VSYNC_MAX_DEVICE_RETRIES` | loop policy |
//! | `VSYNC_PERIOD_MS` | cycle period |
//! | `VSYNC_QUERY_TIMEOUT_MS`, `VSYNC_MAX_AGE_MS` | acquirer |
//! | `VSYNC_MAX_STEP_PERCENT`, `VSYNC_STEP_INTERVAL_MS`, `VSYNC_APPLY_PROFILE` | retune |
//! | `VSYNC_SHIFT`, `VSYNC_SHIFT2`, `VSYNC_STEP_THRESHOLD_US`, `VSYNC_RESET`, `VSYNC_COMMIT` | phase shift |
//! | `VSYNC_DKL_<FIELD>` as `shift:width`, e.g. `VSYNC_DKL_FBDIV_INTGR=0:8` | register layout |

use crate::codec::RetuneConfig;
use crate::error::{Result, VsyncError};
use crate::genlock::ControllerConfig;
use crate::offset::AcquirerConfig;
use crate::shift::ShiftConfig;
use std::str::FromStr;
use std::time::Duration;
use vsync_chip::dkl::{DklField, DklLayout};

/// Every tunable of the driver
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenlockConfig {
    /// Control loop
    pub controller: ControllerConfig,
    /// Offset acquisition
    pub acquirer: AcquirerConfig,
    /// Frequency stepping
    pub retune: RetuneConfig,
    /// One-shot phase shift
    pub shift: ShiftConfig,
    /// DKL field positions
    pub layout: DklLayout,
}

impl GenlockConfig {
    /// Defaults overridden from the process environment
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an unparsable variable or a result that
    /// does not validate.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden through `lookup`
    ///
    /// # Errors
    ///
    /// See [`GenlockConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        let env = Env(&lookup);

        let c = &mut cfg.controller;
        env.parse("VSYNC_KP", &mut c.kp)?;
        env.parse("VSYNC_KI", &mut c.ki)?;
        env.parse("VSYNC_MAX_CORRECTION_PPM", &mut c.max_correction_ppm)?;
        env.parse("VSYNC_DEADBAND_PPM", &mut c.deadband_ppm)?;
        env.parse("VSYNC_TOLERANCE_NS", &mut c.tolerance_ns)?;
        env.parse("VSYNC_TARGET_OFFSET_NS", &mut c.target_offset_ns)?;
        env.parse("VSYNC_LOCK_SAMPLES", &mut c.lock_samples)?;
        env.parse("VSYNC_MAX_DEVICE_RETRIES", &mut c.max_device_retries)?;
        env.millis("VSYNC_PERIOD_MS", &mut c.period)?;

        let a = &mut cfg.acquirer;
        env.millis("VSYNC_QUERY_TIMEOUT_MS", &mut a.query_timeout)?;
        env.millis("VSYNC_MAX_AGE_MS", &mut a.max_age)?;

        let r = &mut cfg.retune;
        env.parse("VSYNC_MAX_STEP_PERCENT", &mut r.max_step_percent)?;
        env.millis("VSYNC_STEP_INTERVAL_MS", &mut r.step_interval)?;
        env.flag("VSYNC_APPLY_PROFILE", &mut r.apply_profile)?;

        let s = &mut cfg.shift;
        env.parse("VSYNC_SHIFT", &mut s.shift_percent)?;
        env.parse("VSYNC_SHIFT2", &mut s.shift2_percent)?;
        env.parse("VSYNC_STEP_THRESHOLD_US", &mut s.step_threshold_us)?;
        env.flag("VSYNC_RESET", &mut s.reset)?;
        env.flag("VSYNC_COMMIT", &mut s.commit)?;

        for field in DklField::ALL {
            let name = format!("VSYNC_DKL_{}", field.name().to_ascii_uppercase());
            if let Some(raw) = env.get(&name) {
                let (shift, width) = parse_field(&name, &raw)?;
                let layout = cfg.layout.field_mut(field);
                layout.shift = shift;
                layout.width = width;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate every part
    ///
    /// # Errors
    ///
    /// Returns the first `InvalidConfig`.
    pub fn validate(&self) -> Result<()> {
        self.controller.validate()?;
        self.acquirer.validate()?;
        self.retune.validate()?;
        self.shift.validate()?;
        if let Some(field) = self.layout.first_invalid() {
            return Err(VsyncError::invalid_config(format!(
                "DKL field {field} does not fit in 32 bits: {:?}",
                self.layout.field(field)
            )));
        }
        if let Some((a, b)) = self.layout.first_overlap() {
            return Err(VsyncError::invalid_config(format!(
                "DKL fields {a} and {b} share bits of {}",
                self.layout.field(a).register.name()
            )));
        }
        Ok(())
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).map(|v| v.trim().to_string())
    }

    fn parse<T: FromStr>(&self, name: &str, slot: &mut T) -> Result<()>
    where
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.get(name) {
            *slot = raw
                .parse()
                .map_err(|e| VsyncError::invalid_config(format!("{name}={raw}: {e}")))?;
        }
        Ok(())
    }

    fn millis(&self, name: &str, slot: &mut Duration) -> Result<()> {
        let mut ms = u64::try_from(slot.as_millis()).unwrap_or(u64::MAX);
        self.parse(name, &mut ms)?;
        *slot = Duration::from_millis(ms);
        Ok(())
    }

    fn flag(&self, name: &str, slot: &mut bool) -> Result<()> {
        if let Some(raw) = self.get(name) {
            *slot = match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(VsyncError::invalid_config(format!(
                        "{name}={raw}: expected a boolean"
                    )))
                }
            };
        }
        Ok(())
    }
}

fn parse_field(name: &str, raw: &str) -> Result<(u32, u32)> {
    let bad = || VsyncError::invalid_config(format!("{name}={raw}: expected shift:width"));
    let (shift, width) = raw.split_once(':').ok_or_else(bad)?;
    let shift = shift.trim().parse().map_err(|_| bad())?;
    let width = width.trim().parse().map_err(|_| bad())?;
    Ok((shift, width))
}
