// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! [`HostCpu`] for a physical ARMv7 core running in Hyp mode.

use core::arch::asm;

use crate::{
    cpu_state::{HostCpu, SysReg},
    memory::Address,
};

macro_rules! mrc {
    ($opc1:literal, $crn:literal, $crm:literal, $opc2:literal) => {{
        let value: u32;
        // SAFETY: reading a CP15 register has no side effect on memory.
        unsafe {
            asm!(
                concat!("mrc p15, ", $opc1, ", {0}, c", $crn, ", c", $crm, ", ", $opc2),
                out(reg) value,
                options(nomem, nostack, preserves_flags)
            );
        }
        u64::from(value)
    }};
}

macro_rules! mcr {
    ($value:expr, $opc1:literal, $crn:literal, $crm:literal, $opc2:literal) => {{
        let value = $value as u32;
        // SAFETY: the hypervisor owns these registers; callers synchronize
        // with `isb` where the architecture requires it.
        unsafe {
            asm!(
                concat!("mcr p15, ", $opc1, ", {0}, c", $crn, ", c", $crm, ", ", $opc2),
                in(reg) value,
                options(nostack, preserves_flags)
            );
        }
    }};
}

macro_rules! mrrc {
    ($opc1:literal, $crm:literal) => {{
        let low: u32;
        let high: u32;
        // SAFETY: see `mrc`.
        unsafe {
            asm!(
                concat!("mrrc p15, ", $opc1, ", {0}, {1}, c", $crm),
                out(reg) low,
                out(reg) high,
                options(nomem, nostack, preserves_flags)
            );
        }
        (u64::from(high) << 32) | u64::from(low)
    }};
}

macro_rules! mcrr {
    ($value:expr, $opc1:literal, $crm:literal) => {{
        let value: u64 = $value;
        // SAFETY: see `mcr`.
        unsafe {
            asm!(
                concat!("mcrr p15, ", $opc1, ", {0}, {1}, c", $crm),
                in(reg) value as u32,
                in(reg) (value >> 32) as u32,
                options(nostack, preserves_flags)
            );
        }
    }};
}

/// The core this code executes on. Must only be used from Hyp mode.
#[derive(Debug, Default)]
pub struct Armv7Cpu;

impl HostCpu for Armv7Cpu {
    fn read_sysreg(&mut self, reg: SysReg) -> u64 {
        match reg {
            SysReg::SCTLR => mrc!(0, 1, 0, 0),
            SysReg::TTBR0 => mrc!(0, 2, 0, 0),
            SysReg::TTBR1 => mrc!(0, 2, 0, 1),
            SysReg::TTBCR => mrc!(0, 2, 0, 2),
            SysReg::DACR => mrc!(0, 3, 0, 0),
            SysReg::DFSR => mrc!(0, 5, 0, 0),
            SysReg::IFSR => mrc!(0, 5, 0, 1),
            SysReg::ADFSR => mrc!(0, 5, 1, 0),
            SysReg::AIFSR => mrc!(0, 5, 1, 1),
            SysReg::DFAR => mrc!(0, 6, 0, 0),
            SysReg::IFAR => mrc!(0, 6, 0, 2),
            SysReg::MAIR0 => mrc!(0, 10, 2, 0),
            SysReg::MAIR1 => mrc!(0, 10, 2, 1),
            SysReg::AMAIR0 => mrc!(0, 10, 3, 0),
            SysReg::AMAIR1 => mrc!(0, 10, 3, 1),
            SysReg::CONTEXTIDR => mrc!(0, 13, 0, 1),
            SysReg::TTBR0_64 => mrrc!(0, 2),
            SysReg::TTBR1_64 => mrrc!(1, 2),
            SysReg::HCR => mrc!(4, 1, 1, 0),
            SysReg::HSR => mrc!(4, 5, 2, 0),
            SysReg::HDFAR => mrc!(4, 6, 0, 0),
            SysReg::HIFAR => mrc!(4, 6, 0, 2),
            SysReg::HPFAR => mrc!(4, 6, 0, 4),
            SysReg::VTCR => mrc!(4, 2, 1, 2),
            SysReg::VTTBR => mrrc!(6, 2),
        }
    }

    fn write_sysreg(&mut self, reg: SysReg, value: u64) {
        match reg {
            SysReg::SCTLR => mcr!(value, 0, 1, 0, 0),
            SysReg::TTBR0 => mcr!(value, 0, 2, 0, 0),
            SysReg::TTBR1 => mcr!(value, 0, 2, 0, 1),
            SysReg::TTBCR => mcr!(value, 0, 2, 0, 2),
            SysReg::DACR => mcr!(value, 0, 3, 0, 0),
            SysReg::DFSR => mcr!(value, 0, 5, 0, 0),
            SysReg::IFSR => mcr!(value, 0, 5, 0, 1),
            SysReg::ADFSR => mcr!(value, 0, 5, 1, 0),
            SysReg::AIFSR => mcr!(value, 0, 5, 1, 1),
            SysReg::DFAR => mcr!(value, 0, 6, 0, 0),
            SysReg::IFAR => mcr!(value, 0, 6, 0, 2),
            SysReg::MAIR0 => mcr!(value, 0, 10, 2, 0),
            SysReg::MAIR1 => mcr!(value, 0, 10, 2, 1),
            SysReg::AMAIR0 => mcr!(value, 0, 10, 3, 0),
            SysReg::AMAIR1 => mcr!(value, 0, 10, 3, 1),
            SysReg::CONTEXTIDR => mcr!(value, 0, 13, 0, 1),
            SysReg::TTBR0_64 => mcrr!(value, 0, 2),
            SysReg::TTBR1_64 => mcrr!(value, 1, 2),
            SysReg::HCR => mcr!(value, 4, 1, 1, 0),
            SysReg::VTCR => mcr!(value, 4, 2, 1, 2),
            SysReg::VTTBR => mcrr!(value, 6, 2),
            SysReg::HSR | SysReg::HDFAR | SysReg::HIFAR | SysReg::HPFAR => {
                log::warn!("Ignoring write of 0x{value:x} to read-only {reg}");
            }
        }
    }

    fn dsb(&mut self) {
        // SAFETY: barrier only.
        unsafe { asm!("dsb sy", options(nostack, preserves_flags)) };
    }

    fn isb(&mut self) {
        // SAFETY: barrier only.
        unsafe { asm!("isb sy", options(nostack, preserves_flags)) };
    }

    fn invalidate_tlb_by_va(&mut self, va: Address) {
        // TLBIMVAA: the page for every ASID, so non-global entries go too.
        mcr!(va.page_floor().0, 0, 8, 7, 3);
    }

    fn invalidate_tlb_all(&mut self) {
        // TLBIALLNSNH
        mcr!(0_u32, 4, 8, 7, 4);
    }
}
