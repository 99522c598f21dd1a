// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! CP15 system registers the hypervisor touches, and the table of control
//! registers whose guest writes `HCR.TVM` traps.

use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};

/// Operand of a CP15 access instruction.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Cp15Access {
    /// `MCR p15, opc1, Rt, CRn, CRm, opc2`
    Mcr { opc1: u8, crn: u8, crm: u8, opc2: u8 },
    /// `MCRR p15, opc1, Rt, Rt2, CRm`
    Mcrr { opc1: u8, crm: u8 },
}

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum SysReg {
    /// `SCTLR`, System Control Register
    SCTLR,
    /// `TTBR0`, Translation Table Base Register 0 (32-bit view)
    TTBR0,
    /// `TTBR1`, Translation Table Base Register 1 (32-bit view)
    TTBR1,
    /// `TTBCR`, Translation Table Base Control Register
    TTBCR,
    /// `DACR`, Domain Access Control Register
    DACR,
    /// `DFSR`, Data Fault Status Register
    DFSR,
    /// `IFSR`, Instruction Fault Status Register
    IFSR,
    /// `ADFSR`, Auxiliary Data Fault Status Register
    ADFSR,
    /// `AIFSR`, Auxiliary Instruction Fault Status Register
    AIFSR,
    /// `DFAR`, Data Fault Address Register
    DFAR,
    /// `IFAR`, Instruction Fault Address Register
    IFAR,
    /// `MAIR0`, Memory Attribute Indirection Register 0
    MAIR0,
    /// `MAIR1`, Memory Attribute Indirection Register 1
    MAIR1,
    /// `AMAIR0`, Auxiliary Memory Attribute Indirection Register 0
    AMAIR0,
    /// `AMAIR1`, Auxiliary Memory Attribute Indirection Register 1
    AMAIR1,
    /// `CONTEXTIDR`, Context ID Register
    CONTEXTIDR,
    /// `TTBR0`, 64-bit LPAE view
    TTBR0_64,
    /// `TTBR1`, 64-bit LPAE view
    TTBR1_64,
    /// `HCR`, Hyp Configuration Register
    HCR,
    /// `HSR`, Hyp Syndrome Register
    HSR,
    /// `HDFAR`, Hyp Data Fault Address Register
    HDFAR,
    /// `HIFAR`, Hyp Instruction Fault Address Register
    HIFAR,
    /// `HPFAR`, Hyp IPA Fault Address Register
    HPFAR,
    /// `VTCR`, Virtualization Translation Control Register
    VTCR,
    /// `VTTBR`, Virtualization Translation Table Base Register
    VTTBR,
}

impl SysReg {
    /// Operand encoding of the register.
    pub const fn encoding(self) -> Cp15Access {
        const fn mcr(opc1: u8, crn: u8, crm: u8, opc2: u8) -> Cp15Access {
            Cp15Access::Mcr {
                opc1,
                crn,
                crm,
                opc2,
            }
        }
        match self {
            Self::SCTLR => mcr(0, 1, 0, 0),
            Self::TTBR0 => mcr(0, 2, 0, 0),
            Self::TTBR1 => mcr(0, 2, 0, 1),
            Self::TTBCR => mcr(0, 2, 0, 2),
            Self::DACR => mcr(0, 3, 0, 0),
            Self::DFSR => mcr(0, 5, 0, 0),
            Self::IFSR => mcr(0, 5, 0, 1),
            Self::ADFSR => mcr(0, 5, 1, 0),
            Self::AIFSR => mcr(0, 5, 1, 1),
            Self::DFAR => mcr(0, 6, 0, 0),
            Self::IFAR => mcr(0, 6, 0, 2),
            Self::MAIR0 => mcr(0, 10, 2, 0),
            Self::MAIR1 => mcr(0, 10, 2, 1),
            Self::AMAIR0 => mcr(0, 10, 3, 0),
            Self::AMAIR1 => mcr(0, 10, 3, 1),
            Self::CONTEXTIDR => mcr(0, 13, 0, 1),
            Self::TTBR0_64 => Cp15Access::Mcrr { opc1: 0, crm: 2 },
            Self::TTBR1_64 => Cp15Access::Mcrr { opc1: 1, crm: 2 },
            Self::HCR => mcr(4, 1, 1, 0),
            Self::HSR => mcr(4, 5, 2, 0),
            Self::HDFAR => mcr(4, 6, 0, 0),
            Self::HIFAR => mcr(4, 6, 0, 2),
            Self::HPFAR => mcr(4, 6, 0, 4),
            Self::VTCR => mcr(4, 2, 1, 2),
            Self::VTTBR => Cp15Access::Mcrr { opc1: 6, crm: 2 },
        }
    }

    /// Whether the register is accessed with `MCRR`/`MRRC`.
    #[inline]
    pub const fn is_64bit(self) -> bool {
        matches!(self.encoding(), Cp15Access::Mcrr { .. })
    }
}

impl std::fmt::Display for SysReg {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{self:?}")
    }
}

bitflags::bitflags! {
    /// `HCR`, Hyp Configuration Register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HypConfiguration: u32 {
        /// Stage 2 translation enable.
        const VM = 1 << 0;
        /// Set/Way invalidation override.
        const SWIO = 1 << 1;
        /// Protected table walk.
        const PTW = 1 << 2;
        /// Physical FIQ routing.
        const FMO = 1 << 3;
        /// Physical IRQ routing.
        const IMO = 1 << 4;
        /// Asynchronous abort routing.
        const AMO = 1 << 5;
        /// Trap `WFI`.
        const TWI = 1 << 13;
        /// Trap `WFE`.
        const TWE = 1 << 14;
        /// Trap `SMC`.
        const TSC = 1 << 19;
        /// Trap `ACTLR` accesses.
        const TAC = 1 << 21;
        /// Trap virtual memory control register writes.
        const TVM = 1 << 26;
        /// Trap general exceptions.
        const TGE = 1 << 27;
    }
}

/// Writes of these registers trap to Hyp mode while `HCR.TVM` is set.
///
/// ARM DDI 0406C.d, B1.14.13 "Trapping accesses to virtual memory control
/// registers".
pub const TVM_REGISTERS: [SysReg; 18] = [
    SysReg::SCTLR,
    SysReg::TTBR0,
    SysReg::TTBR1,
    SysReg::TTBCR,
    SysReg::DACR,
    SysReg::DFSR,
    SysReg::IFSR,
    SysReg::DFAR,
    SysReg::IFAR,
    SysReg::ADFSR,
    SysReg::AIFSR,
    SysReg::MAIR0,
    SysReg::MAIR1,
    SysReg::AMAIR0,
    SysReg::AMAIR1,
    SysReg::CONTEXTIDR,
    SysReg::TTBR0_64,
    SysReg::TTBR1_64,
];

/// What to do with a trapped write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TvmAction {
    /// Forward the guest value to the real register.
    Write,
    /// Read the previous value, then forward the guest value, recording both.
    AuditedWrite,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrappedRegister {
    pub register: SysReg,
    pub action: TvmAction,
}

/// Lookup table from trapped operand encodings to their register.
#[derive(Debug)]
pub struct TrappedRegisters {
    map: FxHashMap<Cp15Access, TrappedRegister>,
}

impl TrappedRegisters {
    /// Build the table. With `audit` set, writes that change the guest's
    /// address space or its identity (`SCTLR`, `TTBR*`, `TTBCR`,
    /// `CONTEXTIDR`) are audited.
    pub fn new(audit: bool) -> Self {
        let audit = audit || cfg!(feature = "always-audit");
        let map = TVM_REGISTERS
            .iter()
            .map(|&register| {
                let action = match register {
                    SysReg::SCTLR
                    | SysReg::TTBR0
                    | SysReg::TTBR1
                    | SysReg::TTBR0_64
                    | SysReg::TTBR1_64
                    | SysReg::TTBCR
                    | SysReg::CONTEXTIDR
                        if audit =>
                    {
                        TvmAction::AuditedWrite
                    }
                    _ => TvmAction::Write,
                };
                (register.encoding(), TrappedRegister { register, action })
            })
            .collect();
        Self { map }
    }

    #[inline]
    pub fn lookup(&self, access: &Cp15Access) -> Option<&TrappedRegister> {
        self.map.get(access)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodings_are_unique() {
        let table = TrappedRegisters::new(false);
        assert_eq!(table.len(), TVM_REGISTERS.len());
        for reg in TVM_REGISTERS {
            assert_eq!(table.lookup(&reg.encoding()).unwrap().register, reg);
        }
        // Hyp registers are never emulated on behalf of the guest.
        assert_eq!(table.lookup(&SysReg::HCR.encoding()), None);
        assert_eq!(table.lookup(&SysReg::VTTBR.encoding()), None);
    }

    #[test]
    fn test_audited_registers() {
        let plain = TrappedRegisters::new(false);
        let audited = TrappedRegisters::new(true);
        let sctlr = SysReg::SCTLR.encoding();
        let mair0 = SysReg::MAIR0.encoding();
        if !cfg!(feature = "always-audit") {
            assert_eq!(plain.lookup(&sctlr).unwrap().action, TvmAction::Write);
        }
        assert_eq!(audited.lookup(&sctlr).unwrap().action, TvmAction::AuditedWrite);
        assert_eq!(audited.lookup(&mair0).unwrap().action, TvmAction::Write);
    }

    #[test]
    fn test_register_width() {
        assert!(SysReg::VTTBR.is_64bit());
        assert!(SysReg::TTBR1_64.is_64bit());
        assert!(!SysReg::TTBR1.is_64bit());
    }
}
