// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! Guest ranges pinned read-only or read-execute.

use serde_derive::{Deserialize, Serialize};

use crate::memory::{Address, MemorySize, Permission};

/// Maximum number of protected regions.
pub const MAX_PROTECTED_REGIONS: usize = 10;

/// A guest physical range whose stage-2 mapping never grants write access.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionRegion {
    pub base: Address,
    pub size: MemorySize,
    pub permission: Permission,
}

impl ProtectionRegion {
    /// Whether `[base, base + size)` contains `address`.
    #[inline]
    pub const fn contains(&self, address: Address) -> bool {
        address.0 >= self.base.0 && address.0 - self.base.0 < self.size.get()
    }

    /// Whether the region shares at least one byte with
    /// `[address, address + size)`.
    #[inline]
    pub const fn overlaps(&self, address: Address, size: u64) -> bool {
        size != 0
            && address.0 < self.end().0
            && self.base.0 < address.0.saturating_add(size)
    }

    /// One past the last byte, saturating at the top of the address space.
    #[inline]
    pub const fn end(&self) -> Address {
        Address(self.base.0.saturating_add(self.size.get()))
    }
}

impl std::fmt::Display for ProtectionRegion {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "[{}, {}) {} ({})",
            self.base,
            self.end(),
            self.permission,
            self.size
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionError {
    /// Registry already holds [`MAX_PROTECTED_REGIONS`] entries.
    CapacityExceeded { region: ProtectionRegion },
    /// Protection enforcement was enabled; the registry is frozen.
    Sealed { region: ProtectionRegion },
    /// Region would grant write access.
    Writable { region: ProtectionRegion },
}

impl std::fmt::Display for ProtectionError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::CapacityExceeded { region } => write!(
                fmt,
                "cannot protect {region}: all {MAX_PROTECTED_REGIONS} protection slots are in use"
            ),
            Self::Sealed { region } => {
                write!(fmt, "cannot protect {region}: protection is already enforced")
            }
            Self::Writable { region } => {
                write!(fmt, "cannot protect {region}: protected regions are never writable")
            }
        }
    }
}

impl std::error::Error for ProtectionError {}

/// Append-only list of protected regions.
#[derive(Debug, Default)]
pub struct ProtectionRegistry {
    regions: Vec<ProtectionRegion>,
    sealed: bool,
}

impl ProtectionRegistry {
    pub fn new() -> Self {
        Self {
            regions: Vec::with_capacity(MAX_PROTECTED_REGIONS),
            sealed: false,
        }
    }

    /// Append `region`. On error the registry is left unchanged.
    pub fn register(&mut self, region: ProtectionRegion) -> Result<(), ProtectionError> {
        if self.sealed {
            return Err(ProtectionError::Sealed { region });
        }
        if region.permission.write() {
            return Err(ProtectionError::Writable { region });
        }
        if self.regions.len() >= MAX_PROTECTED_REGIONS {
            return Err(ProtectionError::CapacityExceeded { region });
        }
        log::info!("Protecting guest region {region}");
        self.regions.push(region);
        Ok(())
    }

    #[inline]
    pub fn contains(&self, address: Address) -> bool {
        self.find(address).is_some()
    }

    /// Whether any region shares a byte with `[address, address + size)`.
    /// Use with a whole page before changing its stage 2 permission: a region
    /// need not start or end on a page boundary.
    pub fn overlaps(&self, address: Address, size: u64) -> bool {
        self.regions.iter().any(|r| r.overlaps(address, size))
    }

    pub fn find(&self, address: Address) -> Option<&ProtectionRegion> {
        self.regions.iter().find(|r| r.contains(address))
    }

    /// Freeze the registry. Later registrations fail with
    /// [`ProtectionError::Sealed`].
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtectionRegion> {
        self.regions.iter()
    }
}
