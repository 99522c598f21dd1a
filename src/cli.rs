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

use std::{borrow::Cow, num::NonZero, path::PathBuf};

use clap::Parser;

use crate::{
    config::{ConfigError, PlatformConfig},
    memory::{Address, MemorySize},
};

pub fn maybe_hex(s: &str) -> Result<Address, Cow<'static, str>> {
    const HEX_PREFIX: &str = "0x";
    const HEX_PREFIX_UPPER: &str = "0X";
    const HEX_PREFIX_LEN: usize = HEX_PREFIX.len();

    let result = if s.starts_with(HEX_PREFIX) || s.starts_with(HEX_PREFIX_UPPER) {
        u64::from_str_radix(&s[HEX_PREFIX_LEN..], 16)
    } else {
        s.parse::<u64>()
    };

    result
        .map(Address)
        .map_err(|err| Cow::Owned(err.to_string()))
}

pub fn memory_size(s: &str) -> Result<MemorySize, Cow<'static, str>> {
    fn err<A>(_: A) -> Cow<'static, str> {
        Cow::Borrowed(
            "Expected decimal or hexadecimal value, with optional suffixes: B (bytes), K/KiB \
             (Kibibytes), M/MiB (Mebibytes) or G/GiB. (A kibibyte is 1024 bytes)",
        )
    }

    if let Ok(num) = maybe_hex(s) {
        return MemorySize::new(num.0)
            .ok_or(Cow::Borrowed("Memory size must be non-zero"));
    }

    for (suffixes, unit, name) in [
        (["KiB", "K"], MemorySize::KiB, "KiB"),
        (["MiB", "M"], MemorySize::MiB, "MiB"),
        (["GiB", "G"], MemorySize::GiB, "GiB"),
        (["B", "B"], NonZero::<u64>::MIN, "B"),
    ] {
        let Some(value) = suffixes.iter().find_map(|suffix| s.strip_suffix(suffix)) else {
            continue;
        };
        let value = maybe_hex(value).map_err(err)?.0;
        return value
            .checked_mul(unit.get())
            .ok_or_else(|| {
                Cow::Owned(format!(
                    "{value}{name} is too large be represented in 64 bits"
                ))
            })
            .and_then(|bytes| {
                MemorySize::new(bytes).ok_or(Cow::Borrowed("Memory size must be non-zero"))
            });
    }

    Err(err(()))
}

/// Boot the W^X hypervisor core on a simulated ARMv7 CPU and replay a
/// script of guest operations.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(short, long, default_value_t = 0, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// JSON platform configuration. Defaults are used for missing fields.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Hexadecimal or decimal base of guest RAM. Must be 1GiB aligned.
    #[arg(long, value_parser=maybe_hex)]
    pub ram_base: Option<Address>,
    /// Size of guest RAM, in whole GiBs.
    #[arg(long, value_parser=memory_size)]
    pub ram_size: Option<MemorySize>,
    #[arg(long)]
    pub vmid: Option<u8>,
    /// Keep an audit log of writes to address space control registers.
    #[arg(long)]
    pub audit: bool,

    /// Path to JSON file with the guest operations to replay.
    #[arg(value_name = "SCRIPT")]
    pub script: PathBuf,
}

impl Args {
    /// Load the configuration file, if any, and apply command-line
    /// overrides.
    pub fn platform_config(&self) -> Result<PlatformConfig, ConfigError> {
        let mut config = match self.config {
            Some(ref path) => PlatformConfig::from_path(path)?,
            None => PlatformConfig::default(),
        };
        if let Some(ram_base) = self.ram_base {
            config.ram_base = ram_base;
        }
        if let Some(ram_size) = self.ram_size {
            config.ram_size = ram_size;
        }
        if let Some(vmid) = self.vmid {
            config.vmid = vmid;
        }
        config.audit_register_writes |= self.audit;
        Ok(config)
    }
}
