// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! Stage-2 translation tables of the guest.
//!
//! The managed RAM window is identity mapped with level 3 pages so that
//! permissions can be changed with 4KiB granularity:
//!
//! ```text
//! level 1 (4 entries, 1GiB each)
//!   [device] -> 1GiB Device block
//!   [ram]    -> level 2 table (512 entries, 2MiB each)
//!                 [i] -> level 3 table (512 entries, 4KiB pages)
//! ```

use bilge::prelude::*;

pub mod descriptors;

pub use descriptors::*;

use crate::memory::{Address, MemorySize, PAGE_SIZE};

/// Entries of the level 1 table: a 32-bit IPA space starting at level 1.
pub const L1_ENTRIES: usize = 4;

/// Entries of a level 2 or level 3 table.
pub const TABLE_ENTRIES: usize = 512;

const GIB: u64 = 1 << 30;

/// Errors in the placement of the managed window, device window and
/// translation tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    Misaligned { what: &'static str, address: Address },
    RamSize { size: MemorySize },
    OutOfRange { what: &'static str, address: Address },
    Overlap { what: &'static str, address: Address },
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Misaligned { what, address } => {
                write!(fmt, "{what} address {address} is not suitably aligned")
            }
            Self::RamSize { size } => {
                write!(fmt, "guest RAM size {size} is not a whole number of GiB")
            }
            Self::OutOfRange { what, address } => write!(
                fmt,
                "{what} at {address} does not fit in the 32-bit intermediate physical address space"
            ),
            Self::Overlap { what, address } => {
                write!(fmt, "{what} at {address} overlaps guest RAM")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

/// Validated placement of the tables and of the windows they map.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WindowLayout {
    ram_base: Address,
    ram_size: MemorySize,
    device_base: Option<Address>,
    table_base: Address,
}

impl WindowLayout {
    pub fn new(
        ram_base: Address,
        ram_size: MemorySize,
        device_base: Option<Address>,
        table_base: Address,
    ) -> Result<Self, LayoutError> {
        let ipa_space = GIB * L1_ENTRIES as u64;
        if !ram_base.is_aligned(GIB) {
            return Err(LayoutError::Misaligned {
                what: "guest RAM",
                address: ram_base,
            });
        }
        if !ram_size.is_multiple_of(MemorySize::GiB) {
            return Err(LayoutError::RamSize { size: ram_size });
        }
        let ram_end = ram_base.0.saturating_add(ram_size.get());
        if ram_end > ipa_space {
            return Err(LayoutError::OutOfRange {
                what: "guest RAM",
                address: ram_base,
            });
        }
        if let Some(device_base) = device_base {
            if !device_base.is_aligned(GIB) {
                return Err(LayoutError::Misaligned {
                    what: "device window",
                    address: device_base,
                });
            }
            if device_base.0 >= ipa_space {
                return Err(LayoutError::OutOfRange {
                    what: "device window",
                    address: device_base,
                });
            }
            if (ram_base.0..ram_end).contains(&device_base.0) {
                return Err(LayoutError::Overlap {
                    what: "device window",
                    address: device_base,
                });
            }
        }
        if !table_base.is_aligned(PAGE_SIZE) {
            return Err(LayoutError::Misaligned {
                what: "translation tables",
                address: table_base,
            });
        }
        let retval = Self {
            ram_base,
            ram_size,
            device_base,
            table_base,
        };
        let tables_end = table_base.0.saturating_add(retval.table_footprint());
        if tables_end > TABLE_ADDRESS_MASK + PAGE_SIZE {
            return Err(LayoutError::OutOfRange {
                what: "translation tables",
                address: table_base,
            });
        }
        if table_base.0 < ram_end && ram_base.0 < tables_end {
            return Err(LayoutError::Overlap {
                what: "translation tables",
                address: table_base,
            });
        }
        Ok(retval)
    }

    #[inline]
    pub const fn ram_base(&self) -> Address {
        self.ram_base
    }

    #[inline]
    pub const fn ram_size(&self) -> MemorySize {
        self.ram_size
    }

    /// One past the last managed address.
    #[inline]
    pub const fn ram_end(&self) -> Address {
        Address(self.ram_base.0 + self.ram_size.get())
    }

    #[inline]
    pub const fn device_base(&self) -> Option<Address> {
        self.device_base
    }

    #[inline]
    pub const fn table_base(&self) -> Address {
        self.table_base
    }

    /// Number of 1GiB level 1 slots covered by guest RAM.
    #[inline]
    pub const fn ram_gibs(&self) -> usize {
        (self.ram_size.get() / GIB) as usize
    }

    /// Number of level 3 tables, one per 2MiB of guest RAM.
    #[inline]
    pub const fn level3_tables(&self) -> usize {
        self.ram_gibs() * TABLE_ENTRIES
    }

    /// Bytes of physical memory the tables occupy at [`Self::table_base`].
    #[inline]
    pub const fn table_footprint(&self) -> u64 {
        (1 + self.ram_gibs() + self.level3_tables()) as u64 * PAGE_SIZE
    }

    #[inline]
    pub const fn contains(&self, address: Address) -> bool {
        address.0 >= self.ram_base.0 && address.0 - self.ram_base.0 < self.ram_size.get()
    }

    fn level2_table_address(&self, gib: usize) -> Address {
        Address(self.table_base.0 + (1 + gib) as u64 * PAGE_SIZE)
    }

    fn level3_table_address(&self, index: usize) -> Address {
        Address(self.table_base.0 + (1 + self.ram_gibs() + index) as u64 * PAGE_SIZE)
    }

    fn table_page(&self, address: Address) -> Option<usize> {
        let offset = address.0.checked_sub(self.table_base.0)?;
        if offset % PAGE_SIZE != 0 || offset >= self.table_footprint() {
            return None;
        }
        Some((offset / PAGE_SIZE) as usize)
    }
}

/// `VTCR`, Virtualization Translation Control Register
#[bitsize(32)]
#[derive(Default, Copy, Clone, FromBits, DebugBits)]
pub struct VirtualizationTranslationControl {
    /// Size offset of the IPA space, signed. (bits `[3:0]`)
    pub t0sz: u4,
    /// Sign extension of `T0SZ`. (bit `[4]`)
    pub s: bool,
    reserved_i: u1,
    /// Starting level of the stage 2 walk. (bits `[7:6]`)
    pub sl0: u2,
    /// Inner cacheability of table walks. (bits `[9:8]`)
    pub irgn0: u2,
    /// Outer cacheability of table walks. (bits `[11:10]`)
    pub orgn0: u2,
    /// Shareability of table walks. (bits `[13:12]`)
    pub sh0: Shareability,
    reserved_ii: u17,
    /// Reserved, RES1. (bit `[31]`)
    pub res1: bool,
}

/// `VTTBR`, Virtualization Translation Table Base Register
#[bitsize(64)]
#[derive(Default, Copy, Clone, FromBits, DebugBits)]
pub struct VirtualizationTranslationTableBase {
    /// Level 1 table address. (bits `[39:0]`)
    pub baddr: u40,
    reserved_i: u8,
    /// (bits `[55:48]`)
    pub vmid: u8,
    reserved_ii: u8,
}

/// Result of a stage 2 walk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Translation {
    pub output: Address,
    pub permission: Permission,
    pub attributes: MemoryAttributes,
    pub level: Level,
}

/// The hypervisor's stage 2 translation tables.
pub struct Stage2Tables {
    layout: WindowLayout,
    level1: [Descriptor; L1_ENTRIES],
    level2: Vec<[Descriptor; TABLE_ENTRIES]>,
    level3: Vec<[Descriptor; TABLE_ENTRIES]>,
}

impl std::fmt::Debug for Stage2Tables {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Stage2Tables")
            .field("layout", &self.layout)
            .field("level1", &self.level1)
            .finish_non_exhaustive()
    }
}

impl Stage2Tables {
    /// Build the identity map of `layout`. Every RAM page starts
    /// [`Permission::ReadWrite`].
    pub fn new(layout: WindowLayout) -> Self {
        let mut level1 = [Descriptor::invalid(); L1_ENTRIES];
        let mut level2 = vec![[Descriptor::invalid(); TABLE_ENTRIES]; layout.ram_gibs()];
        let mut level3 = vec![[Descriptor::invalid(); TABLE_ENTRIES]; layout.level3_tables()];

        if let Some(device_base) = layout.device_base {
            level1[(device_base.0 / GIB) as usize] =
                Descriptor::make_block(device_base, BlockLevel::L1, MemoryAttributes::Device)
                    .with_permission(Permission::ReadWrite);
        }

        let first_slot = (layout.ram_base.0 / GIB) as usize;
        let mut pa = layout.ram_base.0;
        for (gib, l2_table) in level2.iter_mut().enumerate() {
            level1[first_slot + gib] = Descriptor::make_table(layout.level2_table_address(gib));
            for (j, l2_entry) in l2_table.iter_mut().enumerate() {
                let index = gib * TABLE_ENTRIES + j;
                *l2_entry = Descriptor::make_table(layout.level3_table_address(index));
                for l3_entry in level3[index].iter_mut() {
                    *l3_entry = Descriptor::make_page(Address(pa), MemoryAttributes::Normal)
                        .with_permission(Permission::ReadWrite);
                    pa += PAGE_SIZE;
                }
            }
        }
        log::info!(
            "Built stage 2 tables at {} ({}) for guest RAM {}..{}",
            layout.table_base,
            MemorySize::new(layout.table_footprint()).map_or_else(String::new, |s| s.to_string()),
            layout.ram_base,
            layout.ram_end(),
        );

        Self {
            layout,
            level1,
            level2,
            level3,
        }
    }

    #[inline]
    pub const fn layout(&self) -> &WindowLayout {
        &self.layout
    }

    /// Physical address of the level 1 table.
    #[inline]
    pub const fn root_address(&self) -> Address {
        self.layout.table_base
    }

    #[inline]
    pub const fn contains(&self, address: Address) -> bool {
        self.layout.contains(address)
    }

    /// `(level 3 table, entry)` of a managed address.
    fn indices(&self, address: Address) -> Option<(usize, usize)> {
        if !self.contains(address) {
            return None;
        }
        let offset = address.0 - self.layout.ram_base.0;
        Some(((offset >> 21) as usize, ((offset >> 12) & 0x1ff) as usize))
    }

    /// Level 3 descriptor of a managed address.
    pub fn leaf(&self, address: Address) -> Option<&Descriptor> {
        let (l2, l3) = self.indices(address)?;
        Some(&self.level3[l2][l3])
    }

    /// Permission of the page holding `address`, if managed.
    pub fn permission(&self, address: Address) -> Option<Permission> {
        self.leaf(address).map(Descriptor::permission)
    }

    /// Overwrite the permission of every page touching
    /// `[address, address + size)`. Addresses outside the managed window are
    /// ignored. Returns how many pages were written.
    ///
    /// Callers must invalidate stale TLB entries afterwards.
    pub fn set_permission(&mut self, address: Address, size: u64, perm: Permission) -> usize {
        if size == 0 || !self.contains(address) {
            log::trace!("Ignoring permission change of unmanaged range {address}+0x{size:x}");
            return 0;
        }
        let end = address.0.saturating_add(size).min(self.layout.ram_end().0);
        let mut page = address.page_floor().0;
        let mut count = 0;
        while page < end {
            if let Some((l2, l3)) = self.indices(Address(page)) {
                self.level3[l2][l3].set_permission(perm);
                count += 1;
            }
            page += PAGE_SIZE;
        }
        log::trace!("Set {count} page(s) from {address} to {perm}");
        count
    }

    /// Walk the tables from level 1 like the hardware would.
    pub fn translate(&self, ipa: Address) -> Option<Translation> {
        let slot = usize::try_from(ipa.0 / GIB).ok()?;
        let l1 = self.level1.get(slot)?;
        if !l1.is_valid() {
            return None;
        }
        if !l1.is_table_at(Level::L1) {
            return Some(Self::terminal(l1, Level::L1, ipa));
        }
        let l2_table = self
            .layout
            .table_page(l1.output_address())
            .and_then(|page| page.checked_sub(1))
            .and_then(|index| self.level2.get(index))?;
        let l2 = &l2_table[((ipa.0 >> 21) & 0x1ff) as usize];
        if !l2.is_valid() {
            return None;
        }
        if !l2.is_table_at(Level::L2) {
            return Some(Self::terminal(l2, Level::L2, ipa));
        }
        let l3_table = self
            .layout
            .table_page(l2.output_address())
            .and_then(|page| page.checked_sub(1 + self.layout.ram_gibs()))
            .and_then(|index| self.level3.get(index))?;
        let l3 = &l3_table[((ipa.0 >> 12) & 0x1ff) as usize];
        if !l3.is_valid() {
            return None;
        }
        Some(Self::terminal(l3, Level::L3, ipa))
    }

    fn terminal(descriptor: &Descriptor, level: Level, ipa: Address) -> Translation {
        Translation {
            output: Address(descriptor.output_address().0 | (ipa.0 & (level.granule() - 1))),
            permission: descriptor.permission(),
            attributes: descriptor.memory_attributes(),
            level,
        }
    }

    /// `VTCR` value for these tables: 32-bit IPA space, walk from level 1,
    /// write-back cacheable inner shareable walks.
    pub fn vtcr(&self) -> VirtualizationTranslationControl {
        let mut vtcr = VirtualizationTranslationControl::from(0_u32);
        vtcr.set_t0sz(u4::new(0));
        vtcr.set_sl0(u2::new(0b01));
        vtcr.set_irgn0(u2::new(0b11));
        vtcr.set_orgn0(u2::new(0b11));
        vtcr.set_sh0(Shareability::Inner);
        vtcr.set_res1(true);
        vtcr
    }

    /// `VTTBR` value for these tables.
    pub fn vttbr(&self, vmid: u8) -> VirtualizationTranslationTableBase {
        let mut vttbr = VirtualizationTranslationTableBase::from(0_u64);
        vttbr.set_baddr(u40::new(self.root_address().0 & TABLE_ADDRESS_MASK));
        vttbr.set_vmid(vmid);
        vttbr
    }

    /// Every level 3 leaf with its input address.
    pub fn pages(&self) -> impl Iterator<Item = (Address, &Descriptor)> + '_ {
        let base = self.layout.ram_base.0;
        self.level3.iter().enumerate().flat_map(move |(i, table)| {
            table.iter().enumerate().map(move |(j, d)| {
                (
                    Address(base + ((i * TABLE_ENTRIES + j) as u64) * PAGE_SIZE),
                    d,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> WindowLayout {
        WindowLayout::new(
            Address(0x4000_0000),
            MemorySize(MemorySize::GiB),
            Some(Address(0)),
            Address(0xc000_0000),
        )
        .unwrap()
    }

    #[test]
    fn test_layout_validation() {
        let one_gib = MemorySize(MemorySize::GiB);
        assert!(matches!(
            WindowLayout::new(Address(0x4000_1000), one_gib, None, Address(0xc000_0000)),
            Err(LayoutError::Misaligned { .. })
        ));
        assert!(matches!(
            WindowLayout::new(
                Address(0x4000_0000),
                MemorySize::new(0x1000).unwrap(),
                None,
                Address(0xc000_0000)
            ),
            Err(LayoutError::RamSize { .. })
        ));
        assert!(matches!(
            WindowLayout::new(Address(0xc000_0000), one_gib, None, Address(0x1000)),
            Ok(_)
        ));
        assert!(matches!(
            WindowLayout::new(
                Address(0xc000_0000),
                MemorySize::new(2 * MemorySize::GiB.get()).unwrap(),
                None,
                Address(0x1000)
            ),
            Err(LayoutError::OutOfRange { .. })
        ));
        assert!(matches!(
            WindowLayout::new(
                Address(0x4000_0000),
                one_gib,
                Some(Address(0x4000_0000)),
                Address(0xc000_0000)
            ),
            Err(LayoutError::Overlap { .. })
        ));
        assert!(matches!(
            WindowLayout::new(Address(0x4000_0000), one_gib, None, Address(0x7fff_f000)),
            Err(LayoutError::Overlap { .. })
        ));
        assert_eq!(layout().table_footprint(), (1 + 1 + 512) * PAGE_SIZE);
    }

    #[test]
    fn test_identity_map() {
        let tables = Stage2Tables::new(layout());
        for ipa in [0x4000_0000, 0x4000_1234, 0x5fff_f000, 0x7fff_ffff] {
            let t = tables.translate(Address(ipa)).unwrap();
            assert_eq!(t.output, Address(ipa));
            assert_eq!(t.level, Level::L3);
            assert_eq!(t.permission, Permission::ReadWrite);
            assert_eq!(t.attributes, MemoryAttributes::Normal);
        }
        let device = tables.translate(Address(0x1c09_0000)).unwrap();
        assert_eq!(device.output, Address(0x1c09_0000));
        assert_eq!(device.level, Level::L1);
        assert_eq!(device.attributes, MemoryAttributes::Device);
        assert_eq!(device.permission, Permission::ReadWrite);
        assert_eq!(tables.translate(Address(0x8000_0000)), None);
        assert_eq!(tables.translate(Address(0x1_0000_0000)), None);
    }

    #[test]
    fn test_set_permission_indices() {
        let mut tables = Stage2Tables::new(layout());
        // Crosses the boundary between two level 3 tables.
        let written = tables.set_permission(Address(0x401f_f800), 0x1000, Permission::ReadExecute);
        assert_eq!(written, 2);
        assert_eq!(tables.permission(Address(0x401f_f000)), Some(Permission::ReadExecute));
        assert_eq!(tables.permission(Address(0x4020_0000)), Some(Permission::ReadExecute));
        assert_eq!(tables.permission(Address(0x4020_1000)), Some(Permission::ReadWrite));
        assert_eq!(tables.permission(Address(0x401f_e000)), Some(Permission::ReadWrite));
        assert_eq!(
            tables.leaf(Address(0x4020_0000)).unwrap().output_address(),
            Address(0x4020_0000)
        );
    }

    #[test]
    fn test_set_permission_out_of_range() {
        let mut tables = Stage2Tables::new(layout());
        assert_eq!(tables.set_permission(Address(0x1000), 0x1000, Permission::ReadOnly), 0);
        assert_eq!(tables.set_permission(Address(0x4000_0000), 0, Permission::ReadOnly), 0);
        // Clamped at the end of the window.
        assert_eq!(
            tables.set_permission(Address(0x7fff_f000), 0x10_0000, Permission::ReadOnly),
            1
        );
        assert!(tables
            .pages()
            .filter(|(addr, _)| *addr != Address(0x7fff_f000))
            .all(|(_, d)| d.permission() == Permission::ReadWrite));
    }

    #[test]
    fn test_control_registers() {
        let tables = Stage2Tables::new(layout());
        assert_eq!(u32::from(tables.vtcr()), 0x8000_3f40);
        assert_eq!(u64::from(tables.vttbr(5)), 0x0005_0000_c000_0000);
    }
}
