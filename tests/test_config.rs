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

#[macro_use]
mod utils;

use wxvisor::{
    config::{ConfigError, PlatformConfig},
    machine::{guest::Guest, script::Script},
    memory::{Address, LayoutError, Permission},
};

#[test_log::test]
fn test_demo_files() {
    let config = PlatformConfig::from_json(include_str!("../demos/platform.json")).unwrap();
    assert_eq!(config.vmid, 1);
    assert_eq!(config.protected_regions.len(), 1);
    assert_eq!(
        config.protected_regions[0].permission,
        Permission::ReadExecute
    );

    let script = Script::from_json(include_str!("../demos/boot-script.json")).unwrap();
    let mut guest = Guest::boot(config).unwrap();
    let report = script.replay(&mut guest);

    assert_eq!(report.steps.len(), script.operations.len());
    assert!(report.enforcing);
    assert_eq!(report.protected_regions.len(), 2);
    // Both writes to protected memory stayed faulted.
    assert_eq!(report.steps[5].completed, Some(false));
    assert_eq!(report.steps[6].completed, Some(false));
    assert_eq!(report.steps[7].completed, Some(true));
    assert_eq!(report.steps[8].completed, Some(true));
    assert_eq!(report.steps[10].completed, Some(true));
    assert_eq!(report.steps[11].completed, Some(false));
    assert_hex_eq!(report.steps[12].value.unwrap(), 0x00c5_087d);
    assert_eq!(report.statistics.denied, 3);
    assert_eq!(report.statistics.ignored_register_accesses, 1);
    assert_eq!(report.statistics.unhandled["WfiWfe"], 1);
    // TTBR0_64, TTBCR and SCTLR writes are audited.
    assert_eq!(report.audit_log.len(), 3);
    assert_eq!(report.pages["r-x"], 0x100 + 2);
    assert_eq!(report.pages["r--"], 0x80);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["statistics"]["hypercalls"], 2);
    assert_eq!(json["steps"][3]["operation"]["op"], "hvc");
}

#[test_log::test]
fn test_layout_errors() {
    let misaligned = PlatformConfig {
        ram_base: Address(0x4010_0000),
        ..PlatformConfig::default()
    };
    assert!(matches!(
        Guest::boot(misaligned),
        Err(ConfigError::Layout(LayoutError::Misaligned { .. }))
    ));

    let overlapping = PlatformConfig {
        device_base: Some(Address(0x8000_0000)),
        ..PlatformConfig::default()
    };
    assert!(matches!(
        overlapping.validate(),
        Err(ConfigError::Layout(LayoutError::Overlap { .. }))
    ));

    let tables_in_ram = PlatformConfig {
        table_base: Address(0x7000_0000),
        ..PlatformConfig::default()
    };
    let err = tables_in_ram.validate().unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Layout(LayoutError::Overlap { .. })
    ));
    assert!(std::error::Error::source(&err).is_some());

    let too_big = PlatformConfig::from_json(r#"{ "ram_size": 4294967296 }"#).unwrap();
    assert!(matches!(
        too_big.validate(),
        Err(ConfigError::Layout(LayoutError::OutOfRange { .. }))
    ));
}
