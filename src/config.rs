// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! Static platform description.

use std::{num::NonZero, path::Path};

use serde_derive::{Deserialize, Serialize};

use crate::memory::{
    Address, LayoutError, MemorySize, ProtectionRegion, WindowLayout, HIGH_VECTORS_BASE,
    MAX_PROTECTED_REGIONS, PHYS_MEM_START,
};

// SAFETY: Value is non-zero.
const DEFAULT_RAM_SIZE: MemorySize = MemorySize(NonZero::new(2 * MemorySize::GiB.get()).unwrap());

// SAFETY: Value is non-zero.
const DEFAULT_VECTOR_WINDOW_SIZE: MemorySize =
    MemorySize(NonZero::new(64 * MemorySize::KiB.get()).unwrap());

/// Guest virtual range privileged code may execute from before protection
/// regions cover it: the exception vectors.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorWindow {
    pub base: Address,
    pub size: MemorySize,
}

impl VectorWindow {
    #[inline]
    pub const fn contains(&self, address: Address) -> bool {
        address.0 >= self.base.0 && address.0 - self.base.0 < self.size.get()
    }
}

impl Default for VectorWindow {
    fn default() -> Self {
        Self {
            base: Address(HIGH_VECTORS_BASE),
            size: DEFAULT_VECTOR_WINDOW_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformConfig {
    /// Start of the managed guest RAM window. 1GiB aligned.
    pub ram_base: Address,
    /// Size of the managed guest RAM window. Whole GiBs.
    pub ram_size: MemorySize,
    /// 1GiB device window mapped with Device attributes, if any.
    pub device_base: Option<Address>,
    /// Physical address of the stage 2 tables.
    pub table_base: Address,
    pub vmid: u8,
    pub vector_window: VectorWindow,
    /// Set `HCR.TVM` so guest writes of virtual memory control registers
    /// trap.
    pub trap_vm_writes: bool,
    pub audit_register_writes: bool,
    /// Number of register writes the audit log keeps.
    pub audit_log_capacity: usize,
    /// Regions protected before the guest runs.
    pub protected_regions: Vec<ProtectionRegion>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            ram_base: Address(PHYS_MEM_START),
            ram_size: DEFAULT_RAM_SIZE,
            device_base: Some(Address(0)),
            table_base: Address(0xC000_0000),
            vmid: 0,
            vector_window: VectorWindow::default(),
            trap_vm_writes: true,
            audit_register_writes: false,
            audit_log_capacity: 64,
            protected_regions: vec![],
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Layout(LayoutError),
    TooManyRegions { count: usize },
    Region {
        region: ProtectionRegion,
        reason: &'static str,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(fmt, "could not read platform configuration: {err}"),
            Self::Json(err) => write!(fmt, "invalid platform configuration: {err}"),
            Self::Layout(err) => write!(fmt, "invalid memory layout: {err}"),
            Self::TooManyRegions { count } => write!(
                fmt,
                "{count} protected regions configured, at most {MAX_PROTECTED_REGIONS} are \
                 supported"
            ),
            Self::Region { region, reason } => {
                write!(fmt, "invalid protected region {region}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::Layout(err) => Some(err),
            Self::TooManyRegions { .. } | Self::Region { .. } => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<LayoutError> for ConfigError {
    fn from(err: LayoutError) -> Self {
        Self::Layout(err)
    }
}

impl PlatformConfig {
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path)?;
        Self::from_json(&input)
    }

    /// Check the configuration and compute the table layout.
    pub fn validate(&self) -> Result<WindowLayout, ConfigError> {
        let layout =
            WindowLayout::new(self.ram_base, self.ram_size, self.device_base, self.table_base)?;
        if self.protected_regions.len() > MAX_PROTECTED_REGIONS {
            return Err(ConfigError::TooManyRegions {
                count: self.protected_regions.len(),
            });
        }
        for region in &self.protected_regions {
            if region.permission.write() {
                return Err(ConfigError::Region {
                    region: *region,
                    reason: "protected regions cannot be writable",
                });
            }
            let last = Address(region.end().0 - 1);
            if !layout.contains(region.base) || !layout.contains(last) {
                return Err(ConfigError::Region {
                    region: *region,
                    reason: "region is outside guest RAM",
                });
            }
        }
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Permission;

    #[test]
    fn test_defaults() {
        let config = PlatformConfig::default();
        let layout = config.validate().unwrap();
        assert_eq!(layout.ram_base(), Address(0x4000_0000));
        assert_eq!(layout.ram_end(), Address(0xc000_0000));
        assert_eq!(layout.device_base(), Some(Address(0)));
        assert_eq!(config.vector_window.base, Address(0xffff_0000));
        assert_eq!(config.vector_window.size.get(), 0x1_0000);
        assert!(config.vector_window.contains(Address(0xffff_ffff)));
        assert!(!config.vector_window.contains(Address(0xfffe_ffff)));
    }

    #[test]
    fn test_from_json() {
        let config = PlatformConfig::from_json(
            r#"{
                "ram_size": 1073741824,
                "vmid": 3,
                "protected_regions": [
                    { "base": 1073774592, "size": 8192, "permission": "ReadExecute" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.vmid, 3);
        assert_eq!(config.ram_base, Address(0x4000_0000));
        assert_eq!(config.protected_regions[0].base, Address(0x4000_8000));
        assert_eq!(config.protected_regions[0].permission, Permission::ReadExecute);
        config.validate().unwrap();

        assert!(matches!(
            PlatformConfig::from_json(r#"{ "ram_size": 0 }"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            PlatformConfig::from_json(r#"{ "ram_sise": 4096 }"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_invalid_regions() {
        let mut config = PlatformConfig::default();
        config.protected_regions.push(ProtectionRegion {
            base: Address(0xbfff_f000),
            size: MemorySize::new(0x2000).unwrap(),
            permission: Permission::ReadOnly,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Region { .. })
        ));
        config.protected_regions[0].base = Address(0x4000_0000);
        config.protected_regions[0].permission = Permission::ReadWrite;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Region { .. })
        ));
        config.protected_regions[0].permission = Permission::ReadOnly;
        config.protected_regions = vec![config.protected_regions[0]; MAX_PROTECTED_REGIONS + 1];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooManyRegions { count: 11 })
        ));
    }
}
