//
// wxvisor
//
// Copyright 2025- Manos Pitsidianakis
//
// This file is part of wxvisor.
//
// wxvisor is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// wxvisor is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with wxvisor. If not, see <http://www.gnu.org/licenses/>.
//
// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later

use std::num::NonZero;

use serde_derive::{Deserialize, Serialize};

/// A non-zero size of a guest memory range in bytes.
#[derive(Copy, Eq, PartialEq, PartialOrd, Ord, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct MemorySize(pub NonZero<u64>);

#[allow(non_upper_case_globals)]
impl MemorySize {
    // SAFETY: value is non-zero.
    /// A KiB.
    pub const KiB: NonZero<u64> = NonZero::new(1024).unwrap();
    // SAFETY: value is non-zero.
    /// A MiB.
    pub const MiB: NonZero<u64> = NonZero::new(Self::KiB.get() * 1024).unwrap();
    // SAFETY: value is non-zero.
    /// A GiB.
    pub const GiB: NonZero<u64> = NonZero::new(Self::MiB.get() * 1024).unwrap();

    /// Constructs a new size, `None` if `value` is zero.
    #[inline]
    pub const fn new(value: u64) -> Option<Self> {
        match NonZero::new(value) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Whether the size is a whole multiple of `unit`.
    #[inline]
    pub const fn is_multiple_of(self, unit: NonZero<u64>) -> bool {
        self.get() % unit.get() == 0
    }
}

impl std::fmt::Display for MemorySize {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let bytes = self.get();
        if bytes < Self::KiB.get() || !self.is_multiple_of(Self::KiB) {
            write!(fmt, "{}bytes", bytes)
        } else if bytes < Self::MiB.get() || !self.is_multiple_of(Self::MiB) {
            write!(fmt, "{}KiB", bytes / Self::KiB)
        } else if bytes < Self::GiB.get() || !self.is_multiple_of(Self::GiB) {
            write!(fmt, "{}MiB", bytes / Self::MiB)
        } else {
            write!(fmt, "{}GiB", bytes / Self::GiB)
        }
    }
}

impl std::fmt::Debug for MemorySize {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(self, fmt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_size_display() {
        assert_eq!(MemorySize::new(0), None);
        assert_eq!(MemorySize::new(512).unwrap().to_string(), "512bytes");
        assert_eq!(MemorySize::new(0x3000).unwrap().to_string(), "12KiB");
        assert_eq!(MemorySize(MemorySize::GiB).to_string(), "1GiB");
        assert_eq!(
            MemorySize::new(MemorySize::GiB.get() + MemorySize::MiB.get())
                .unwrap()
                .to_string(),
            "1025MiB"
        );
    }
}
