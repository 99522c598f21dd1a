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

//! Guest register state at trap time and host CPU primitives.

use bilge::prelude::*;

#[cfg(target_arch = "arm")]
pub mod armv7;
pub mod sysregs;

pub use sysregs::*;

use crate::memory::Address;

#[bitsize(5)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, Debug)]
pub enum ProcessorMode {
    User = 0b10000,
    FIQ = 0b10001,
    IRQ = 0b10010,
    #[default]
    Supervisor = 0b10011,
    Monitor = 0b10110,
    Abort = 0b10111,
    Hyp = 0b11010,
    #[fallback]
    Undefined = 0b11011,
    System = 0b11111,
}

/// `SPSR_hyp`, the guest's `CPSR` when the trap was taken.
#[bitsize(32)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
pub struct ProgramStatus {
    /// (bits `[4:0]`)
    pub mode: ProcessorMode,
    /// Thumb execution state. (bit `[5]`)
    pub t: bool,
    /// FIQ mask. (bit `[6]`)
    pub f: bool,
    /// IRQ mask. (bit `[7]`)
    pub i: bool,
    /// Asynchronous abort mask. (bit `[8]`)
    pub a: bool,
    /// Big endianness. (bit `[9]`)
    pub e: bool,
    /// `IT[7:2]`, `GE[3:0]`, `J`, `IT[1:0]`. (bits `[26:10]`)
    pub it_ge: u17,
    /// Saturation. (bit `[27]`)
    pub q: bool,
    /// (bit `[28]`)
    pub v: bool,
    /// (bit `[29]`)
    pub c: bool,
    /// (bit `[30]`)
    pub z: bool,
    /// (bit `[31]`)
    pub n: bool,
}

/// The trapping guest's general purpose registers and return state.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct GuestRegisters {
    pub r: [u32; 13],
    pub sp: u32,
    pub lr: u32,
    /// Return address, `ELR_hyp`.
    pub pc: u32,
    pub spsr: ProgramStatus,
}

impl GuestRegisters {
    /// Register `index` as encoded in a syndrome's transfer register field.
    pub fn get(&self, index: u8) -> Option<u32> {
        match index {
            0..=12 => Some(self.r[usize::from(index)]),
            13 => Some(self.sp),
            14 => Some(self.lr),
            15 => Some(self.pc),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: u8) -> Option<&mut u32> {
        match index {
            0..=12 => Some(&mut self.r[usize::from(index)]),
            13 => Some(&mut self.sp),
            14 => Some(&mut self.lr),
            15 => Some(&mut self.pc),
            _ => None,
        }
    }

    #[inline]
    pub fn mode(&self) -> ProcessorMode {
        self.spsr.mode()
    }

    pub fn set_mode(&mut self, mode: ProcessorMode) {
        self.spsr.set_mode(mode);
    }

    /// Resume after the trapped instruction.
    #[inline]
    pub fn advance_pc(&mut self, instruction_length: u32) {
        self.pc = self.pc.wrapping_add(instruction_length);
    }
}

/// Privileged primitives of the physical CPU the hypervisor runs on.
pub trait HostCpu {
    /// Read a system register; 32-bit registers are zero extended.
    fn read_sysreg(&mut self, reg: SysReg) -> u64;

    /// Write a system register; 32-bit registers take the low word.
    fn write_sysreg(&mut self, reg: SysReg, value: u64);

    /// Data synchronization barrier.
    fn dsb(&mut self);

    /// Instruction synchronization barrier.
    fn isb(&mut self);

    /// Invalidate the TLB entries of guest virtual address `va` under every
    /// ASID (`TLBIMVAA`).
    fn invalidate_tlb_by_va(&mut self, va: Address);

    /// Invalidate all non-secure non-Hyp TLB entries (`TLBIALLNSNH`).
    fn invalidate_tlb_all(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_indices() {
        let mut regs = GuestRegisters::default();
        for i in 0..16_u8 {
            *regs.get_mut(i).unwrap() = 0x100 + u32::from(i);
        }
        assert_eq!(regs.r[12], 0x10c);
        assert_eq!(regs.sp, 0x10d);
        assert_eq!(regs.lr, 0x10e);
        assert_eq!(regs.pc, 0x10f);
        assert_eq!(regs.get(0), Some(0x100));
        assert_eq!(regs.get(16), None);
        assert_eq!(regs.get_mut(31), None);
    }

    #[test]
    fn test_program_status_mode() {
        let spsr = ProgramStatus::from(0x6000_01d0_u32);
        assert_eq!(spsr.mode(), ProcessorMode::User);
        assert!(spsr.z());
        assert!(spsr.c());
        assert!(spsr.i());
        assert!(spsr.a());
        let mut regs = GuestRegisters {
            spsr,
            ..GuestRegisters::default()
        };
        regs.set_mode(ProcessorMode::Supervisor);
        assert_eq!(u32::from(regs.spsr), 0x6000_01d3);
        assert_eq!(
            ProgramStatus::from(0x0000_0015_u32).mode(),
            ProcessorMode::Undefined
        );
    }
}
