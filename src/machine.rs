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

//! The hypervisor context: everything trap handlers read and mutate.

use std::collections::VecDeque;

use indexmap::IndexMap;
use serde_derive::Serialize;

use crate::{
    config::{ConfigError, PlatformConfig},
    cpu_state::{HostCpu, HypConfiguration, SysReg, TrappedRegisters},
    memory::{
        Address, Permission, ProtectionError, ProtectionRegion, ProtectionRegistry, Stage2Tables,
        PAGE_SIZE,
    },
};

mod dispatch;
mod hypercall;
pub mod guest;
pub mod script;
pub mod simulated;
pub mod tlb;

pub use dispatch::*;
pub use hypercall::*;

/// A virtualized control register write kept in the audit log.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegisterWrite {
    pub register: SysReg,
    pub old: u64,
    pub new: u64,
}

/// Counters of trap handling.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TrapStatistics {
    pub traps: u64,
    pub register_writes: u64,
    pub register_reads: u64,
    /// Accesses to registers that are not virtualized.
    pub ignored_register_accesses: u64,
    pub hypercalls: u64,
    pub rejected_hypercalls: u64,
    pub remapped_writable: u64,
    pub remapped_executable: u64,
    pub denied: u64,
    /// Traps resumed past without emulation, by exception class in the
    /// order first seen.
    pub unhandled: IndexMap<String, u64>,
}

/// Outcome of [`Hypervisor::set_permission`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionUpdate {
    pub written: usize,
    /// Pages left untouched because they are protected.
    pub refused: usize,
}

/// State owned by the hypervisor for the lifetime of the guest.
pub struct Hypervisor<C: HostCpu> {
    pub cpu: C,
    config: PlatformConfig,
    tables: Stage2Tables,
    protection: ProtectionRegistry,
    trapped: TrappedRegisters,
    audit_log: VecDeque<RegisterWrite>,
    stats: TrapStatistics,
}

impl<C: HostCpu> std::fmt::Debug for Hypervisor<C> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Hypervisor")
            .field("config", &self.config)
            .field("tables", &self.tables)
            .field("protection", &self.protection)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<C: HostCpu> Hypervisor<C> {
    /// Build the stage 2 tables, protect the configured regions and turn
    /// stage 2 translation on. There is no way back.
    pub fn boot(cpu: C, config: PlatformConfig) -> Result<Self, ConfigError> {
        let layout = config.validate()?;
        let mut retval = Self {
            cpu,
            tables: Stage2Tables::new(layout),
            protection: ProtectionRegistry::new(),
            trapped: TrappedRegisters::new(config.audit_register_writes),
            audit_log: VecDeque::with_capacity(config.audit_log_capacity),
            stats: TrapStatistics::default(),
            config,
        };
        for region in retval.config.protected_regions.clone() {
            retval.protect(region).map_err(|_| ConfigError::Region {
                region,
                reason: "protection registry rejected the region",
            })?;
        }
        retval.install();
        Ok(retval)
    }

    fn install(&mut self) {
        let vtcr = self.tables.vtcr();
        let vttbr = self.tables.vttbr(self.config.vmid);
        self.cpu.write_sysreg(SysReg::VTCR, u32::from(vtcr).into());
        self.cpu.write_sysreg(SysReg::VTTBR, u64::from(vttbr));
        self.cpu.isb();

        let mut hcr = HypConfiguration::from_bits_retain(self.cpu.read_sysreg(SysReg::HCR) as u32);
        hcr |= HypConfiguration::VM;
        if self.config.trap_vm_writes {
            hcr |= HypConfiguration::TVM;
        }
        self.cpu.write_sysreg(SysReg::HCR, hcr.bits().into());
        self.cpu.isb();
        self.cpu.invalidate_tlb_all();
        self.cpu.dsb();
        self.cpu.isb();
        log::info!(
            "Stage 2 translation enabled: VTTBR=0x{:016x} VTCR=0x{:08x} HCR=0x{:08x}",
            u64::from(vttbr),
            u32::from(vtcr),
            hcr.bits()
        );
    }

    #[inline]
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    #[inline]
    pub fn tables(&self) -> &Stage2Tables {
        &self.tables
    }

    #[inline]
    pub fn protection(&self) -> &ProtectionRegistry {
        &self.protection
    }

    #[inline]
    pub fn stats(&self) -> &TrapStatistics {
        &self.stats
    }

    pub fn audit_log(&self) -> impl Iterator<Item = &RegisterWrite> {
        self.audit_log.iter()
    }

    /// Whether protection enforcement was enabled and the registry sealed.
    #[inline]
    pub fn is_enforcing(&self) -> bool {
        self.protection.is_sealed()
    }

    /// Change the permission of `[address, address + size)`, clamped to the
    /// managed window, except that pages sharing any byte with a protected
    /// region are never made writable.
    ///
    /// Callers must flush the TLB before resuming the guest.
    pub fn set_permission(
        &mut self,
        address: Address,
        size: u64,
        perm: Permission,
    ) -> PermissionUpdate {
        if !perm.write() {
            return PermissionUpdate {
                written: self.tables.set_permission(address, size, perm),
                refused: 0,
            };
        }
        let mut update = PermissionUpdate::default();
        if size == 0 || !self.tables.contains(address) {
            return update;
        }
        let end = address
            .0
            .saturating_add(size)
            .min(self.tables.layout().ram_end().0);
        let mut page = address.page_floor().0;
        while page < end {
            if self.protection.overlaps(Address(page), PAGE_SIZE) {
                log::warn!("Refusing to make protected page {} writable", Address(page));
                update.refused += 1;
            } else {
                update.written += self.tables.set_permission(Address(page), PAGE_SIZE, perm);
            }
            page = match page.checked_add(PAGE_SIZE) {
                Some(next) => next,
                None => break,
            };
        }
        update
    }

    /// Register `region` and apply its permission to the stage 2 tables.
    pub fn protect(&mut self, region: ProtectionRegion) -> Result<usize, ProtectionError> {
        self.protection.register(region)?;
        Ok(self
            .tables
            .set_permission(region.base, region.size.get(), region.permission))
    }

    /// Drop the stale translation of one guest page.
    pub fn flush_page(&mut self, va: Address) {
        self.cpu.dsb();
        self.cpu.invalidate_tlb_by_va(va.page_floor());
        self.cpu.dsb();
        self.cpu.isb();
    }

    /// Drop every guest translation.
    pub fn flush_all(&mut self) {
        self.cpu.dsb();
        self.cpu.invalidate_tlb_all();
        self.cpu.dsb();
        self.cpu.isb();
    }

    fn record_write(&mut self, write: RegisterWrite) {
        log::info!(
            "Guest wrote {}: 0x{:x} -> 0x{:x}",
            write.register,
            write.old,
            write.new
        );
        if self.config.audit_log_capacity == 0 {
            return;
        }
        if self.audit_log.len() == self.config.audit_log_capacity {
            self.audit_log.pop_front();
        }
        self.audit_log.push_back(write);
    }
}
