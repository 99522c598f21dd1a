// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! [`HostCpu`] backed by a register bank and a TLB model, for running the
//! hypervisor off-target.

use rustc_hash::FxHashMap;

use crate::{
    cpu_state::{HostCpu, SysReg},
    machine::tlb::Tlb,
    memory::Address,
};

/// A privileged operation performed on the simulated core.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CpuEvent {
    Write { register: SysReg, value: u64 },
    Dsb,
    Isb,
    InvalidateVa(Address),
    InvalidateAll,
}

#[derive(Debug, Default)]
pub struct SimulatedCpu {
    registers: FxHashMap<SysReg, u64>,
    pub tlb: Tlb,
    events: Vec<CpuEvent>,
}

impl SimulatedCpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Privileged operations in program order.
    pub fn events(&self) -> &[CpuEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Set a register as the hardware would, without recording an event.
    /// Used to fill in syndrome registers before a trap.
    pub fn set_register(&mut self, reg: SysReg, value: u64) {
        self.store(reg, value);
    }

    /// Register value as the guest sees it.
    pub fn register(&self, reg: SysReg) -> u64 {
        match reg {
            SysReg::TTBR0 => self.load(SysReg::TTBR0_64) & 0xFFFF_FFFF,
            SysReg::TTBR1 => self.load(SysReg::TTBR1_64) & 0xFFFF_FFFF,
            other => self.load(other),
        }
    }

    fn load(&self, reg: SysReg) -> u64 {
        self.registers.get(&reg).copied().unwrap_or_default()
    }

    fn store(&mut self, reg: SysReg, value: u64) {
        // The 32-bit TTBR views alias the low word of the LPAE views.
        let (reg, value) = match reg {
            SysReg::TTBR0 => (
                SysReg::TTBR0_64,
                (self.load(SysReg::TTBR0_64) & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF),
            ),
            SysReg::TTBR1 => (
                SysReg::TTBR1_64,
                (self.load(SysReg::TTBR1_64) & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF),
            ),
            other if other.is_64bit() => (other, value),
            other => (other, value & 0xFFFF_FFFF),
        };
        self.registers.insert(reg, value);
    }
}

impl HostCpu for SimulatedCpu {
    fn read_sysreg(&mut self, reg: SysReg) -> u64 {
        self.register(reg)
    }

    fn write_sysreg(&mut self, reg: SysReg, value: u64) {
        if matches!(
            reg,
            SysReg::HSR | SysReg::HDFAR | SysReg::HIFAR | SysReg::HPFAR
        ) {
            log::warn!("Ignoring write of 0x{value:x} to read-only {reg}");
            return;
        }
        self.events.push(CpuEvent::Write {
            register: reg,
            value,
        });
        self.store(reg, value);
    }

    fn dsb(&mut self) {
        self.events.push(CpuEvent::Dsb);
    }

    fn isb(&mut self) {
        self.events.push(CpuEvent::Isb);
    }

    fn invalidate_tlb_by_va(&mut self, va: Address) {
        self.events.push(CpuEvent::InvalidateVa(va));
        self.tlb.invalidate(va);
    }

    fn invalidate_tlb_all(&mut self) {
        self.events.push(CpuEvent::InvalidateAll);
        self.tlb.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_views() {
        let mut cpu = SimulatedCpu::new();
        cpu.write_sysreg(SysReg::TTBR0_64, 0x0012_0000_8000_4000);
        assert_eq!(cpu.read_sysreg(SysReg::TTBR0), 0x8000_4000);
        cpu.write_sysreg(SysReg::TTBR0, 0x1_8000_5000);
        assert_eq!(cpu.read_sysreg(SysReg::TTBR0_64), 0x0012_0000_8000_5000);
        cpu.write_sysreg(SysReg::SCTLR, 0xdead_0000_00c5_0879);
        assert_eq!(cpu.read_sysreg(SysReg::SCTLR), 0x00c5_0879);

        cpu.write_sysreg(SysReg::HSR, 0x9000_0046);
        assert_eq!(cpu.read_sysreg(SysReg::HSR), 0);
        cpu.set_register(SysReg::HSR, 0x9000_0046);
        assert_eq!(cpu.read_sysreg(SysReg::HSR), 0x9000_0046);
        assert_eq!(cpu.events().len(), 3);
    }
}
