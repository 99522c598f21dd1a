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

use wxvisor::{
    config::PlatformConfig,
    machine::guest::Guest,
    memory::{Address, MemorySize},
};

#[macro_export]
macro_rules! assert_hex_eq {
    ($left: expr, $right: expr$(,)?) => {{
        let left: u64 = $left;
        let right: u64 = $right;
        assert_eq!(
            left,
            right,
            "Comparing {left_s} with {right_s} failed:\n0x{left:016x} {left_s}\n0x{right:016x} \
             {right_s}\n0b{left:064b} {left_s}\n0b{right:064b} {right_s}",
            left_s = stringify!($left),
            right_s = stringify!($right),
            left = left,
            right = right,
        );
    }};
}

/// 1GiB of guest RAM at address zero, the device window right above it and
/// the stage 2 tables at 2GiB.
#[allow(dead_code)]
pub fn low_ram_config() -> PlatformConfig {
    PlatformConfig {
        ram_base: Address(0),
        ram_size: MemorySize(MemorySize::GiB),
        device_base: Some(Address(0x4000_0000)),
        table_base: Address(0x8000_0000),
        ..PlatformConfig::default()
    }
}

#[allow(dead_code)]
pub fn make_test_guest(config: PlatformConfig) -> Guest {
    Guest::boot(config).unwrap()
}
