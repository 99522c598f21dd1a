// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! LPAE stage-2 translation table descriptors.
//!
//! See ARM DDI 0406C.d, B3.6.1 "Long-descriptor translation table format
//! descriptors" and B3.6.2 "Memory attributes in the Long-descriptor
//! translation table format descriptors".

use bilge::prelude::*;
use serde_derive::{Deserialize, Serialize};

use crate::memory::Address;

/// Output address bits `[39:30]` of a level 1 block.
pub const L1_BLOCK_ADDRESS_MASK: u64 = 0x0000_00FF_C000_0000;
/// Output address bits `[39:21]` of a level 2 block.
pub const L2_BLOCK_ADDRESS_MASK: u64 = 0x0000_00FF_FFE0_0000;
/// Output address bits `[39:12]` of a level 3 page.
pub const L3_PAGE_ADDRESS_MASK: u64 = 0x0000_00FF_FFFF_F000;
/// Next-level table address bits `[39:12]`.
pub const TABLE_ADDRESS_MASK: u64 = 0x0000_00FF_FFFF_F000;

/// Translation table lookup level.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    /// 1GiB blocks
    L1 = 1,
    /// 2MiB blocks
    L2 = 2,
    /// 4KiB pages
    L3 = 3,
}

impl Level {
    /// Mask of the output address bits of a terminal descriptor at this level.
    pub const fn output_mask(self) -> u64 {
        match self {
            Self::L1 => L1_BLOCK_ADDRESS_MASK,
            Self::L2 => L2_BLOCK_ADDRESS_MASK,
            Self::L3 => L3_PAGE_ADDRESS_MASK,
        }
    }

    /// Size of the region a terminal descriptor at this level maps.
    pub const fn granule(self) -> u64 {
        match self {
            Self::L1 => 1 << 30,
            Self::L2 => 1 << 21,
            Self::L3 => 1 << 12,
        }
    }
}

/// Levels that can hold a block descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlockLevel {
    /// 1GiB blocks
    L1,
    /// 2MiB blocks
    L2,
}

impl From<BlockLevel> for Level {
    fn from(level: BlockLevel) -> Self {
        match level {
            BlockLevel::L1 => Self::L1,
            BlockLevel::L2 => Self::L2,
        }
    }
}

/// Stage 2 `MemAttr[3:0]`.
#[bitsize(4)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBits)]
pub enum MemoryAttributes {
    /// Device memory.
    Device = 0b0001,
    /// Normal memory, outer and inner non-cacheable.
    NormalNonCacheable = 0b0101,
    /// Normal memory, outer and inner write-back cacheable.
    Normal = 0b1111,
    /// Any encoding this hypervisor never produces.
    #[default]
    #[fallback]
    Other = 0b0000,
}

/// `SH[1:0]`
#[bitsize(2)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBits)]
pub enum Shareability {
    #[default]
    NonShareable = 0b00,
    Unpredictable = 0b01,
    Outer = 0b10,
    Inner = 0b11,
}

/// Stage 2 access permission of a terminal descriptor.
///
/// Each variant is one `(S2AP[0], S2AP[1], XN)` combination; there is no
/// variant granting both write and execute.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// `(read, write, xn) = (1, 0, 1)`
    ReadOnly,
    /// `(read, write, xn) = (1, 0, 0)`
    ReadExecute,
    /// `(read, write, xn) = (1, 1, 1)`
    ReadWrite,
}

impl Permission {
    #[inline]
    pub const fn read(self) -> bool {
        true
    }

    #[inline]
    pub const fn write(self) -> bool {
        matches!(self, Self::ReadWrite)
    }

    #[inline]
    pub const fn execute_never(self) -> bool {
        !matches!(self, Self::ReadExecute)
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::ReadOnly => write!(fmt, "r--"),
            Self::ReadExecute => write!(fmt, "r-x"),
            Self::ReadWrite => write!(fmt, "rw-"),
        }
    }
}

#[bitsize(64)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
struct RawDescriptor {
    /// (bit `[0]`)
    valid: bool,
    /// Table (levels 1 and 2) or page (level 3). (bit `[1]`)
    table: bool,
    /// (bits `[5:2]`)
    mem_attr: MemoryAttributes,
    /// `S2AP[0]` (bit `[6]`)
    read: bool,
    /// `S2AP[1]` (bit `[7]`)
    write: bool,
    /// (bits `[9:8]`)
    shareability: Shareability,
    /// (bit `[10]`)
    access_flag: bool,
    reserved_i: u1,
    /// Address bits `[47:12]`. (bits `[47:12]`)
    output_address: u36,
    reserved_ii: u4,
    /// (bit `[52]`)
    contiguous: bool,
    reserved_iii: u1,
    /// (bit `[54]`)
    execute_never: bool,
    /// Reserved for software use. (bits `[58:55]`)
    software: u4,
    reserved_iv: u5,
}

/// A 64-bit stage-2 translation table entry.
///
/// Permission bits can only be written through [`Permission`], so a
/// descriptor is never writable and executable at once.
#[derive(Default, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Descriptor(RawDescriptor);

impl Descriptor {
    /// A descriptor that faults on any access.
    #[inline]
    pub fn invalid() -> Self {
        Self::default()
    }

    fn terminal(output: Address, level: Level, attrs: MemoryAttributes) -> Self {
        let mut raw = RawDescriptor::from(0_u64);
        raw.set_valid(true);
        raw.set_table(matches!(level, Level::L3));
        raw.set_access_flag(true);
        raw.set_mem_attr(attrs);
        raw.set_shareability(Shareability::Inner);
        raw.set_output_address(u36::new((output.0 & level.output_mask()) >> 12));
        let mut retval = Self(raw);
        retval.set_permission(Permission::ReadOnly);
        retval
    }

    /// Level 1 or 2 block mapping `output`, read-only until told otherwise.
    pub fn make_block(output: Address, level: BlockLevel, attrs: MemoryAttributes) -> Self {
        Self::terminal(output, level.into(), attrs)
    }

    /// Level 3 page mapping `output`, read-only until told otherwise.
    pub fn make_page(output: Address, attrs: MemoryAttributes) -> Self {
        Self::terminal(output, Level::L3, attrs)
    }

    /// Pointer to a next-level table.
    pub fn make_table(child: Address) -> Self {
        let mut raw = RawDescriptor::from(0_u64);
        raw.set_valid(true);
        raw.set_table(true);
        raw.set_output_address(u36::new((child.0 & TABLE_ADDRESS_MASK) >> 12));
        Self(raw)
    }

    /// Overwrite the permission sub-field, leaving every other field as is.
    pub fn set_permission(&mut self, perm: Permission) {
        self.0.set_read(perm.read());
        self.0.set_write(perm.write());
        self.0.set_execute_never(perm.execute_never());
    }

    #[must_use]
    pub fn with_permission(mut self, perm: Permission) -> Self {
        self.set_permission(perm);
        self
    }

    /// Permission of a terminal descriptor.
    pub fn permission(&self) -> Permission {
        match (self.0.write(), self.0.execute_never()) {
            (false, true) => Permission::ReadOnly,
            (false, false) => Permission::ReadExecute,
            (true, true) => Permission::ReadWrite,
            (true, false) => unreachable!("descriptor {self:?} is writable and executable"),
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0.valid()
    }

    /// Whether this entry points to a next-level table at `level`.
    #[inline]
    pub fn is_table_at(&self, level: Level) -> bool {
        self.is_valid() && self.0.table() && !matches!(level, Level::L3)
    }

    #[inline]
    pub fn output_address(&self) -> Address {
        Address(self.0.output_address().value() << 12)
    }

    #[inline]
    pub fn memory_attributes(&self) -> MemoryAttributes {
        self.0.mem_attr()
    }

    #[inline]
    pub fn shareability(&self) -> Shareability {
        self.0.shareability()
    }

    #[inline]
    pub fn access_flag(&self) -> bool {
        self.0.access_flag()
    }

    /// Raw value as written to memory for the table walker.
    #[inline]
    pub fn bits(&self) -> u64 {
        u64::from(self.0)
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Descriptor")
            .field("bits", &format_args!("0x{:016x}", self.bits()))
            .field("valid", &self.0.valid())
            .field("table", &self.0.table())
            .field("output_address", &self.output_address())
            .field("read", &self.0.read())
            .field("write", &self.0.write())
            .field("execute_never", &self.0.execute_never())
            .field("mem_attr", &self.0.mem_attr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_page_layout() {
        let page = Descriptor::make_page(Address(0x4020_3000), MemoryAttributes::Normal);
        assert!(page.is_valid());
        assert!(!page.is_table_at(Level::L3));
        assert!(page.access_flag());
        assert_eq!(page.shareability(), Shareability::Inner);
        assert_eq!(page.output_address(), Address(0x4020_3000));
        assert_eq!(page.permission(), Permission::ReadOnly);
        // valid | page | MemAttr=0b1111 | S2AP=0b01 | SH=0b11 | AF | XN
        assert_eq!(page.bits(), 0x0040_0000_4020_377f);
    }

    #[test]
    fn test_make_block_masks_output() {
        let block = Descriptor::make_block(
            Address(0x4000_0000 + 0x12_3456),
            BlockLevel::L2,
            MemoryAttributes::Normal,
        );
        assert_eq!(block.output_address(), Address(0x4000_0000));
        let gib = Descriptor::make_block(
            Address(0x7fff_ffff),
            BlockLevel::L1,
            MemoryAttributes::Device,
        );
        assert_eq!(gib.output_address(), Address(0x4000_0000));
        assert_eq!(gib.memory_attributes(), MemoryAttributes::Device);
        assert!(!gib.is_table_at(Level::L1));
        assert_eq!(gib.shareability(), Shareability::Inner);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(MemoryAttributes::default(), MemoryAttributes::Other);
        assert_eq!(Shareability::default(), Shareability::NonShareable);
        let invalid = Descriptor::invalid();
        assert!(!invalid.is_valid());
        assert_eq!(invalid.bits(), 0);
        assert_eq!(invalid.memory_attributes(), MemoryAttributes::Other);
    }

    #[test]
    fn test_make_table() {
        let table = Descriptor::make_table(Address(0xc000_1000));
        assert!(table.is_table_at(Level::L1));
        assert!(table.is_table_at(Level::L2));
        assert_eq!(table.output_address(), Address(0xc000_1000));
        assert_eq!(table.bits(), 0xc000_1003);
    }

    #[test]
    fn test_permission_bits() {
        let page = Descriptor::make_page(Address(0x4000_0000), MemoryAttributes::Normal);
        for (perm, read, write, xn) in [
            (Permission::ReadOnly, true, false, true),
            (Permission::ReadExecute, true, false, false),
            (Permission::ReadWrite, true, true, true),
        ] {
            let d = page.with_permission(perm);
            assert_eq!((d.0.read(), d.0.write(), d.0.execute_never()), (read, write, xn));
            assert_eq!(d.permission(), perm);
            assert_eq!(d.output_address(), page.output_address());
            assert_eq!(d.with_permission(perm), d, "idempotent");
        }
    }
}
