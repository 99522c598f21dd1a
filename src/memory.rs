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

//! Guest physical memory: addresses, sizes, stage-2 tables and protected
//! regions.

mod address;
mod size;

pub mod protection;
pub mod stage2;

pub use address::*;
pub use protection::*;
pub use size::*;
pub use stage2::*;

/// Translation granule: a small page.
pub const PAGE_SIZE: u64 = 0x1000;

/// Default starting offset of guest DRAM inside the physical address space.
pub const PHYS_MEM_START: u64 = 0x4000_0000;

/// Default high exception vector base (`SCTLR.V == 1`).
pub const HIGH_VECTORS_BASE: u64 = 0xFFFF_0000;
