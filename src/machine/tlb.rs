// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! Translation lookaside buffer of the simulated core

use indexmap::IndexMap;

use crate::memory::{Address, Permission};

/// Default number of cached translations.
pub const TLB_ENTRIES: usize = 64;

/// A cached combined stage 1 and stage 2 translation of a guest page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TlbEntry {
    pub ipa: Address,
    pub permission: Permission,
}

/// Translation lookaside buffer, keyed by ASID and guest virtual page,
/// evicting the least recently used entry.
#[derive(Debug)]
pub struct Tlb {
    map: IndexMap<(u8, u64), TlbEntry>,
    capacity: usize,
}

impl Tlb {
    /// Create an empty buffer
    pub fn new(capacity: usize) -> Self {
        Self {
            map: IndexMap::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Get the cached translation of the page holding `va` under `asid`.
    pub fn get(&mut self, asid: u8, va: Address) -> Option<TlbEntry> {
        let index = self.map.get_index_of(&(asid, va.page_floor().0))?;
        let last = self.map.len() - 1;
        self.map.move_index(index, last);
        self.map.get_index(last).map(|(_, entry)| *entry)
    }

    pub fn insert(&mut self, asid: u8, va: Address, entry: TlbEntry) {
        let key = (asid, va.page_floor().0);
        if self.map.shift_remove(&key).is_none() && self.map.len() == self.capacity {
            self.map.shift_remove_index(0);
        }
        self.map.insert(key, entry);
    }

    /// Drop the entries of the page holding `va`, whatever their ASID.
    pub fn invalidate(&mut self, va: Address) -> bool {
        let page = va.page_floor().0;
        let len = self.map.len();
        self.map.retain(|&(_, key), _| key != page);
        self.map.len() != len
    }

    /// Clear buffer
    pub fn clear(&mut self) {
        self.map.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new(TLB_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ipa: u64) -> TlbEntry {
        TlbEntry {
            ipa: Address(ipa),
            permission: Permission::ReadWrite,
        }
    }

    #[test]
    fn test_lru_eviction() {
        let mut tlb = Tlb::new(2);
        tlb.insert(0, Address(0x1000), entry(0x4000_1000));
        tlb.insert(0, Address(0x2000), entry(0x4000_2000));
        // Touch the first page so the second one is evicted.
        assert_eq!(tlb.get(0, Address(0x1abc)), Some(entry(0x4000_1000)));
        tlb.insert(0, Address(0x3000), entry(0x4000_3000));
        assert_eq!(tlb.len(), 2);
        assert_eq!(tlb.get(0, Address(0x2000)), None);
        assert!(tlb.get(0, Address(0x1000)).is_some());
        assert!(tlb.get(0, Address(0x3000)).is_some());
    }

    #[test]
    fn test_invalidate() {
        let mut tlb = Tlb::default();
        tlb.insert(0, Address(0x1000), entry(0x1000));
        tlb.insert(0, Address(0x1000), entry(0x5000));
        assert_eq!(tlb.len(), 1);
        assert!(tlb.invalidate(Address(0x1fff)));
        assert!(!tlb.invalidate(Address(0x1000)));
        tlb.insert(0, Address(0x2000), entry(0x2000));
        tlb.clear();
        assert!(tlb.is_empty());
    }

    #[test]
    fn test_invalidate_every_asid() {
        let mut tlb = Tlb::default();
        tlb.insert(0, Address(0x1000), entry(0x1000));
        tlb.insert(5, Address(0x1000), entry(0x1000));
        tlb.insert(5, Address(0x2000), entry(0x2000));
        assert_eq!(tlb.get(7, Address(0x1000)), None);
        assert!(tlb.invalidate(Address(0x1000)));
        assert_eq!(tlb.get(0, Address(0x1000)), None);
        assert_eq!(tlb.get(5, Address(0x1000)), None);
        assert_eq!(tlb.get(5, Address(0x2000)), Some(entry(0x2000)));
    }
}
