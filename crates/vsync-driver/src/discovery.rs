//! Runtime device discovery
//!
//! Scans PCI sysfs (`/sys/bus/pci/devices/*`) for display controllers. The
//! root is a parameter so tests can point it at a fake tree.

use crate::error::{Result, VsyncError};
use std::fmt;
use std::path::{Path, PathBuf};
use vsync_chip::bar::BAR_COUNT;
use vsync_chip::pcie::{self, Platform};

/// Default PCI sysfs device directory
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Filter used to pick a display controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelector {
    /// PCI vendor ID (`None` matches any)
    pub vendor_id: Option<u16>,
    /// PCI device ID (`None` matches any)
    pub device_id: Option<u16>,
    /// PCI base class (`None` matches any)
    pub class: Option<u8>,
    /// PCI address such as `0000:00:02.0` (`None` matches any)
    pub address: Option<String>,
}

impl Default for DeviceSelector {
    /// Any Intel display controller
    fn default() -> Self {
        Self {
            vendor_id: Some(pcie::INTEL_VENDOR_ID),
            device_id: None,
            class: Some(pcie::DISPLAY_CLASS),
            address: None,
        }
    }
}

impl DeviceSelector {
    /// Select a device by PCI address, keeping the default filters
    #[must_use]
    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    /// Restrict to one device ID
    #[must_use]
    pub const fn with_device_id(mut self, device_id: u16) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Whether `info` passes every filter
    #[must_use]
    pub fn matches(&self, info: &PciDevice) -> bool {
        self.vendor_id.map_or(true, |v| v == info.vendor_id)
            && self.device_id.map_or(true, |d| d == info.device_id)
            && self.class.map_or(true, |c| (info.class_code >> 16) as u8 == c)
            && self.address.as_deref().map_or(true, |a| a == info.address)
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(v) = self.vendor_id {
            parts.push(format!("vendor={v:04x}"));
        }
        if let Some(d) = self.device_id {
            parts.push(format!("device={d:04x}"));
        }
        if let Some(c) = self.class {
            parts.push(format!("class={c:02x}"));
        }
        if let Some(a) = &self.address {
            parts.push(format!("address={a}"));
        }
        if parts.is_empty() {
            f.write_str("any device")
        } else {
            f.write_str(&parts.join(","))
        }
    }
}

/// One BAR (or ROM) range as reported by the sysfs `resource` file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarInfo {
    /// Physical base address
    pub base: u64,
    /// Size in bytes (0 if unimplemented)
    pub size: u64,
    /// Resource flags
    pub flags: u64,
}

impl BarInfo {
    /// Whether the BAR is implemented
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.size != 0
    }
}

/// Information about a discovered PCI function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    /// PCI address (`0000:00:02.0`)
    pub address: String,
    /// Vendor ID
    pub vendor_id: u16,
    /// Device ID
    pub device_id: u16,
    /// 24-bit class code
    pub class_code: u32,
    /// Interrupt line
    pub irq: u32,
    /// Standard BARs
    pub bars: [BarInfo; BAR_COUNT],
    /// Expansion ROM
    pub rom: BarInfo,
    /// Display platform derived from the device ID
    pub platform: Platform,
    /// sysfs directory of the function
    pub sysfs_path: PathBuf,
}

impl PciDevice {
    /// Path of the `resourceN` file for BAR `index`
    #[must_use]
    pub fn resource_path(&self, index: usize) -> PathBuf {
        self.sysfs_path.join(format!("resource{index}"))
    }

    /// Read one function directory
    ///
    /// # Errors
    ///
    /// Returns an error if `vendor`, `device` or `class` are missing or
    /// malformed. `irq` and `resource` are optional.
    pub fn from_sysfs(path: &Path) -> Result<Self> {
        let address = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let vendor_id = read_hex_u16(&path.join("vendor"))?;
        let device_id = read_hex_u16(&path.join("device"))?;
        let class_code = read_hex(&path.join("class"))?;
        let class_code = u32::try_from(class_code & 0x00FF_FFFF).unwrap_or_default();

        let irq = std::fs::read_to_string(path.join("irq"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);

        let (bars, rom) = match std::fs::read_to_string(path.join("resource")) {
            Ok(content) => parse_resource(&content),
            Err(_) => ([BarInfo::default(); BAR_COUNT], BarInfo::default()),
        };

        Ok(Self {
            address,
            vendor_id,
            device_id,
            class_code,
            irq,
            bars,
            rom,
            platform: Platform::from_device_id(device_id),
            sysfs_path: path.to_path_buf(),
        })
    }

    /// A Tiger Lake iGPU description for software backends and tests
    #[must_use]
    pub fn simulated() -> Self {
        let mut bars = [BarInfo::default(); BAR_COUNT];
        bars[0] = BarInfo {
            base: 0x6000_0000,
            size: 16 * 1024 * 1024,
            flags: 0x0014_0204,
        };
        bars[2] = BarInfo {
            base: 0x4000_0000,
            size: 256 * 1024 * 1024,
            flags: 0x0014_220C,
        };
        Self {
            address: pcie::IGPU_ADDRESS.to_string(),
            vendor_id: pcie::INTEL_VENDOR_ID,
            device_id: 0x9A49,
            class_code: 0x03_0000,
            irq: 16,
            bars,
            rom: BarInfo::default(),
            platform: Platform::TigerLake,
            sysfs_path: PathBuf::from(SYSFS_PCI_DEVICES).join(pcie::IGPU_ADDRESS),
        }
    }

    /// Reject devices genlock cannot drive
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedDevice` for non-display functions and for
    /// platforms without DKL PHYs.
    pub fn ensure_supported(&self) -> Result<()> {
        let reason = if !pcie::is_display_class(self.class_code) {
            Some("not a display controller".to_string())
        } else if !self.platform.has_dkl_phys() {
            Some(format!("platform {} has no DKL PHYs", self.platform.name()))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(VsyncError::UnsupportedDevice {
                vendor_id: self.vendor_id,
                device_id: self.device_id,
                class_code: self.class_code,
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Device manager for runtime discovery
#[derive(Debug)]
pub struct DeviceManager {
    root: PathBuf,
    devices: Vec<PciDevice>,
}

impl DeviceManager {
    /// Scan the system PCI sysfs tree
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the sysfs directory cannot be read.
    pub fn discover() -> Result<Self> {
        Self::discover_in(SYSFS_PCI_DEVICES)
    }

    /// Scan a PCI sysfs tree rooted at `root`
    ///
    /// Functions with unreadable identity files are skipped with a debug log.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `root` cannot be read.
    pub fn discover_in(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        tracing::info!("Scanning PCI devices under {}", root.display());

        let mut devices = Vec::new();
        for entry in std::fs::read_dir(root)?.flatten() {
            let path = entry.path();
            match PciDevice::from_sysfs(&path) {
                Ok(info) => devices.push(info),
                Err(e) => tracing::debug!("Skipping {}: {e}", path.display()),
            }
        }

        // read_dir order is unspecified
        devices.sort_by(|a, b| a.address.cmp(&b.address));

        tracing::info!("Found {} PCI function(s)", devices.len());
        Ok(Self {
            root: root.to_path_buf(),
            devices,
        })
    }

    /// Root the scan started from
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All scanned functions
    #[must_use]
    pub fn devices(&self) -> &[PciDevice] {
        &self.devices
    }

    /// Display controllers, supported or not
    pub fn displays(&self) -> impl Iterator<Item = &PciDevice> {
        self.devices
            .iter()
            .filter(|d| pcie::is_display_class(d.class_code))
    }

    /// Functions matching `selector`
    pub fn matching<'s>(
        &'s self,
        selector: &DeviceSelector,
    ) -> impl Iterator<Item = &'s PciDevice> + 's {
        let selector = selector.clone();
        self.devices.iter().filter(move |d| selector.matches(d))
    }

    /// First match for `selector` that genlock can drive
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` if nothing matches, or the first
    /// `UnsupportedDevice` error if every match is unsupported.
    pub fn select(&self, selector: &DeviceSelector) -> Result<&PciDevice> {
        let mut rejected = None;
        for info in self.matching(selector) {
            match info.ensure_supported() {
                Ok(()) => {
                    tracing::info!(
                        "Selected {} ({:04x}:{:04x}, {})",
                        info.address,
                        info.vendor_id,
                        info.device_id,
                        info.platform.name()
                    );
                    return Ok(info);
                }
                Err(e) => {
                    tracing::debug!("{}: {e}", info.address);
                    rejected.get_or_insert(e);
                }
            }
        }
        Err(rejected.unwrap_or_else(|| VsyncError::device_not_found(selector.to_string())))
    }
}

/// Parse the sysfs `resource` file: one `start end flags` triple per line,
/// BARs 0-5 first and the expansion ROM on line 6.
fn parse_resource(content: &str) -> ([BarInfo; BAR_COUNT], BarInfo) {
    let mut bars = [BarInfo::default(); BAR_COUNT];
    let mut rom = BarInfo::default();

    for (index, line) in content.lines().enumerate().take(BAR_COUNT + 1) {
        let fields: Vec<u64> = line.split_whitespace().filter_map(parse_hex).collect();
        let [start, end, flags] = fields[..] else {
            continue;
        };
        let size = if end > start || (start != 0 && end == start) {
            end - start + 1
        } else {
            0
        };
        let info = BarInfo {
            base: start,
            size,
            flags,
        };
        if index < BAR_COUNT {
            bars[index] = info;
        } else {
            rom = info;
        }
    }
    (bars, rom)
}

fn parse_hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim().trim_start_matches("0x"), 16).ok()
}

/// Read a hexadecimal value from sysfs
fn read_hex(path: &Path) -> Result<u64> {
    let content = std::fs::read_to_string(path)?;
    parse_hex(&content).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid hex value in {}", path.display()),
        )
        .into()
    })
}

fn read_hex_u16(path: &Path) -> Result<u16> {
    let value = read_hex(path)?;
    u16::try_from(value).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{value:#x} in {} is not a 16-bit id", path.display()),
        )
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_parsing() {
        let content = "\
0x000000605c000000 0x000000605cffffff 0x0000000000140204
0x0000000000000000 0x0000000000000000 0x0000000000000000
0x0000004000000000 0x000000400fffffff 0x000000000014220c
0x0000000000000000 0x0000000000000000 0x0000000000000000
0x0000000000004000 0x000000000000403f 0x0000000000040101
0x0000000000000000 0x0000000000000000 0x0000000000000000
0x00000000000c0000 0x00000000000dffff 0x0000000000000212
";
        let (bars, rom) = parse_resource(content);
        assert_eq!(bars[0].base, 0x60_5C00_0000);
        assert_eq!(bars[0].size, 16 * 1024 * 1024);
        assert!(!bars[1].is_present());
        assert_eq!(bars[2].size, 256 * 1024 * 1024);
        assert_eq!(bars[4].size, 0x40);
        assert_eq!(rom.size, 0x2_0000);
    }

    #[test]
    fn malformed_resource_lines_are_ignored() {
        let (bars, rom) = parse_resource("garbage\n0x0 0x0\n");
        assert!(bars.iter().all(|b| !b.is_present()));
        assert!(!rom.is_present());
    }

    #[test]
    fn default_selector_matches_intel_display() {
        let sel = DeviceSelector::default();
        let mut dev = PciDevice::simulated();
        assert!(sel.matches(&dev));
        dev.class_code = 0x02_0000;
        assert!(!sel.matches(&dev));
    }

    #[test]
    fn address_selector() {
        let dev = PciDevice::simulated();
        assert!(DeviceSelector::address("0000:00:02.0").matches(&dev));
        assert!(!DeviceSelector::address("0000:01:00.0").matches(&dev));
        assert_eq!(
            DeviceSelector::address("0000:00:02.0").to_string(),
            "vendor=8086,class=03,address=0000:00:02.0"
        );
    }

    #[test]
    fn unsupported_platform_is_rejected() {
        let mut dev = PciDevice::simulated();
        assert!(dev.ensure_supported().is_ok());
        dev.device_id = 0x4680;
        dev.platform = Platform::from_device_id(0x4680);
        assert!(matches!(
            dev.ensure_supported(),
            Err(VsyncError::UnsupportedDevice { device_id: 0x4680, .. })
        ));
    }
}
