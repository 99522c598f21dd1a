// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! Hyp Syndrome Register decoding.
//!
//! See ARM DDI 0406C.d, B3.13.6 "Use of the HSR".

use bilge::prelude::*;

use crate::{cpu_state::sysregs::Cp15Access, memory::Address};

/// `HSR`, Hyp Syndrome Register
#[bitsize(32)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
pub struct HypSyndrome {
    /// Instruction Specific Syndrome. (bits `[24:0]`)
    pub iss: u25,
    /// Instruction length: 32-bit when set, 16-bit Thumb otherwise. (bit
    /// `[25]`)
    pub il: bool,
    /// Exception Class. (bits `[31:26]`)
    pub ec: u6,
}

impl HypSyndrome {
    /// Assemble a syndrome value.
    pub fn build(class: ExceptionClass, il: bool, iss: u32) -> Self {
        let mut retval = Self::from(0_u32);
        retval.set_ec(u6::new(class.code()));
        retval.set_il(il);
        retval.set_iss(u25::new(iss & 0x1ff_ffff));
        retval
    }

    #[inline]
    pub fn class(&self) -> ExceptionClass {
        ExceptionClass::from(self.ec().value())
    }

    /// Size in bytes of the trapped instruction.
    #[inline]
    pub fn instruction_length(&self) -> u32 {
        if self.il() {
            4
        } else {
            2
        }
    }

    #[inline]
    pub fn cp32(&self) -> Cp32Iss {
        Cp32Iss::from(self.iss())
    }

    #[inline]
    pub fn cp64(&self) -> Cp64Iss {
        Cp64Iss::from(self.iss())
    }

    #[inline]
    pub fn data_abort(&self) -> DataAbortIss {
        DataAbortIss::from(self.iss())
    }

    #[inline]
    pub fn instruction_abort(&self) -> InstructionAbortIss {
        InstructionAbortIss::from(self.iss())
    }

    #[inline]
    pub fn hvc(&self) -> HvcIss {
        HvcIss::from(self.iss())
    }
}

/// `HSR.EC` values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExceptionClass {
    /// Unknown reason
    Unknown,
    /// Trapped `WFI` or `WFE`
    WfiWfe,
    /// Trapped `MCR` or `MRC` access to CP15
    Cp15_32,
    /// Trapped `MCRR` or `MRRC` access to CP15
    Cp15_64,
    /// Trapped `MCR` or `MRC` access to CP14
    Cp14_32,
    /// Trapped `LDC` or `STC` access to CP14
    Cp14Ldc,
    /// `HCPTR`-trapped access to CP0-CP13
    Hcptr,
    /// Trapped `MRC` or `VMRS` access to CP10
    Cp10,
    /// Trapped `BXJ`
    Bxj,
    /// Trapped `MRRC` access to CP14
    Cp14_64,
    /// Supervisor call routed to Hyp mode
    Svc,
    /// Hypervisor call
    Hvc,
    /// Trapped `SMC`
    Smc,
    /// Prefetch abort from a lower privilege level
    InstructionAbortLower,
    /// Prefetch abort taken in Hyp mode
    InstructionAbortHyp,
    /// Data abort from a lower privilege level
    DataAbortLower,
    /// Data abort taken in Hyp mode
    DataAbortHyp,
    /// Encoding the architecture leaves unallocated.
    Undefined(u8),
}

impl From<u8> for ExceptionClass {
    fn from(val: u8) -> Self {
        match val {
            0x00 => Self::Unknown,
            0x01 => Self::WfiWfe,
            0x03 => Self::Cp15_32,
            0x04 => Self::Cp15_64,
            0x05 => Self::Cp14_32,
            0x06 => Self::Cp14Ldc,
            0x07 => Self::Hcptr,
            0x08 => Self::Cp10,
            0x0a => Self::Bxj,
            0x0c => Self::Cp14_64,
            0x11 => Self::Svc,
            0x12 => Self::Hvc,
            0x13 => Self::Smc,
            0x20 => Self::InstructionAbortLower,
            0x21 => Self::InstructionAbortHyp,
            0x24 => Self::DataAbortLower,
            0x25 => Self::DataAbortHyp,
            other => Self::Undefined(other),
        }
    }
}

impl ExceptionClass {
    /// The `HSR.EC` encoding.
    pub const fn code(self) -> u8 {
        match self {
            Self::Unknown => 0x00,
            Self::WfiWfe => 0x01,
            Self::Cp15_32 => 0x03,
            Self::Cp15_64 => 0x04,
            Self::Cp14_32 => 0x05,
            Self::Cp14Ldc => 0x06,
            Self::Hcptr => 0x07,
            Self::Cp10 => 0x08,
            Self::Bxj => 0x0a,
            Self::Cp14_64 => 0x0c,
            Self::Svc => 0x11,
            Self::Hvc => 0x12,
            Self::Smc => 0x13,
            Self::InstructionAbortLower => 0x20,
            Self::InstructionAbortHyp => 0x21,
            Self::DataAbortLower => 0x24,
            Self::DataAbortHyp => 0x25,
            Self::Undefined(v) => v & 0x3f,
        }
    }

    /// Every allocated class.
    pub const ALL: [Self; 17] = [
        Self::Unknown,
        Self::WfiWfe,
        Self::Cp15_32,
        Self::Cp15_64,
        Self::Cp14_32,
        Self::Cp14Ldc,
        Self::Hcptr,
        Self::Cp10,
        Self::Bxj,
        Self::Cp14_64,
        Self::Svc,
        Self::Hvc,
        Self::Smc,
        Self::InstructionAbortLower,
        Self::InstructionAbortHyp,
        Self::DataAbortLower,
        Self::DataAbortHyp,
    ];
}

impl std::fmt::Display for ExceptionClass {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Undefined(code) => write!(fmt, "Undefined(0x{code:02x})"),
            other => write!(fmt, "{other:?}"),
        }
    }
}

/// ISS of a trapped `MCR`/`MRC`.
#[bitsize(25)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
pub struct Cp32Iss {
    /// Direction: set for a read (`MRC`). (bit `[0]`)
    pub read: bool,
    /// (bits `[4:1]`)
    pub crm: u4,
    /// Transfer register. (bits `[9:5]`)
    pub rt: u5,
    /// (bits `[13:10]`)
    pub crn: u4,
    /// (bits `[16:14]`)
    pub opc1: u3,
    /// (bits `[19:17]`)
    pub opc2: u3,
    /// (bits `[23:20]`)
    pub cond: u4,
    /// (bit `[24]`)
    pub cv: bool,
}

impl Cp32Iss {
    /// The register operand of the access with direction, transfer
    /// register and condition masked out.
    pub fn access(&self) -> Cp15Access {
        Cp15Access::Mcr {
            opc1: self.opc1().value(),
            crn: self.crn().value(),
            crm: self.crm().value(),
            opc2: self.opc2().value(),
        }
    }
}

/// ISS of a trapped `MCRR`/`MRRC`.
#[bitsize(25)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
pub struct Cp64Iss {
    /// Direction: set for a read (`MRRC`). (bit `[0]`)
    pub read: bool,
    /// (bits `[4:1]`)
    pub crm: u4,
    /// Low word transfer register. (bits `[9:5]`)
    pub rt: u5,
    /// High word transfer register. (bits `[14:10]`)
    pub rt2: u5,
    reserved_i: u1,
    /// (bits `[19:16]`)
    pub opc1: u4,
    /// (bits `[23:20]`)
    pub cond: u4,
    /// (bit `[24]`)
    pub cv: bool,
}

impl Cp64Iss {
    pub fn access(&self) -> Cp15Access {
        Cp15Access::Mcrr {
            opc1: self.opc1().value(),
            crm: self.crm().value(),
        }
    }
}

/// ISS of a data abort.
#[bitsize(25)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
pub struct DataAbortIss {
    /// Data fault status code. (bits `[5:0]`)
    pub dfsc: u6,
    /// Write not read. (bit `[6]`)
    pub wnr: bool,
    /// Fault on a stage 2 access made for a stage 1 walk. (bit `[7]`)
    pub s1ptw: bool,
    /// Cache maintenance. (bit `[8]`)
    pub cm: bool,
    /// External abort type. (bit `[9]`)
    pub ea: bool,
    reserved_i: u6,
    /// Syndrome register transfer. (bits `[20:16]`)
    pub srt: u5,
    /// Syndrome sign extend. (bit `[21]`)
    pub sse: bool,
    /// Syndrome access size. (bits `[23:22]`)
    pub sas: u2,
    /// Instruction syndrome valid. (bit `[24]`)
    pub isv: bool,
}

/// ISS of a prefetch abort.
#[bitsize(25)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
pub struct InstructionAbortIss {
    /// Instruction fault status code. (bits `[5:0]`)
    pub ifsc: u6,
    reserved_i: u1,
    /// (bit `[7]`)
    pub s1ptw: bool,
    reserved_ii: u1,
    /// (bit `[9]`)
    pub ea: bool,
    reserved_iii: u15,
}

/// ISS of an `HVC`.
#[bitsize(25)]
#[derive(Default, Copy, Clone, PartialEq, Eq, FromBits, DebugBits)]
pub struct HvcIss {
    /// The instruction's immediate. (bits `[15:0]`)
    pub imm16: u16,
    reserved_i: u9,
}

/// Fault types of the long-descriptor fault status code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    AddressSize,
    Translation,
    AccessFlag,
    Permission,
    SyncExternal,
    AsyncExternal,
    SyncExternalOnWalk,
    SyncParity,
    AsyncParity,
    SyncParityOnWalk,
    Alignment,
    Debug,
    TLBConflict,
    Lockdown,
    Exclusive,
    /// Reserved encoding
    Reserved,
}

/// Decoded `DFSC`/`IFSC`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FaultStatus {
    pub fault: Fault,
    /// Lookup level, for faults that report one.
    pub level: Option<u8>,
}

impl Fault {
    /// Long-descriptor `FSC` code for this fault at `level`.
    ///
    /// `EncodeLDFSC`
    pub fn encode_ldfsc(&self, level: u8) -> u8 {
        let level = level & 0b11;
        match self {
            Self::AddressSize => level,
            Self::Translation => (0b0001 << 2) | level,
            Self::AccessFlag => (0b0010 << 2) | level,
            Self::Permission => (0b0011 << 2) | level,
            Self::SyncExternal => 0b010000,
            Self::AsyncExternal => 0b010001,
            Self::SyncExternalOnWalk => (0b0101 << 2) | level,
            Self::SyncParity => 0b011000,
            Self::AsyncParity => 0b011001,
            Self::SyncParityOnWalk => (0b0111 << 2) | level,
            Self::Alignment => 0b100001,
            Self::Debug => 0b100010,
            Self::TLBConflict => 0b110000,
            Self::Lockdown => 0b110100,
            Self::Exclusive => 0b110101,
            Self::Reserved => 0b111111,
        }
    }
}

impl FaultStatus {
    /// Inverse of [`Fault::encode_ldfsc`].
    pub fn decode(fsc: u8) -> Self {
        let level = Some(fsc & 0b11);
        let (fault, level) = match fsc & 0x3f {
            0b000000..=0b000011 => (Fault::AddressSize, level),
            0b000100..=0b000111 => (Fault::Translation, level),
            0b001000..=0b001011 => (Fault::AccessFlag, level),
            0b001100..=0b001111 => (Fault::Permission, level),
            0b010000 => (Fault::SyncExternal, None),
            0b010001 => (Fault::AsyncExternal, None),
            0b010100..=0b010111 => (Fault::SyncExternalOnWalk, level),
            0b011000 => (Fault::SyncParity, None),
            0b011001 => (Fault::AsyncParity, None),
            0b011100..=0b011111 => (Fault::SyncParityOnWalk, level),
            0b100001 => (Fault::Alignment, None),
            0b100010 => (Fault::Debug, None),
            0b110000 => (Fault::TLBConflict, None),
            0b110100 => (Fault::Lockdown, None),
            0b110101 => (Fault::Exclusive, None),
            _ => (Fault::Reserved, None),
        };
        Self { fault, level }
    }

    #[inline]
    pub fn is_permission(&self) -> bool {
        matches!(self.fault, Fault::Permission)
    }
}

impl From<u6> for FaultStatus {
    fn from(fsc: u6) -> Self {
        Self::decode(fsc.value())
    }
}

/// Intermediate physical address of a stage 2 fault: `HPFAR.FIPA` gives
/// bits `[39:12]`, the page offset comes from `HDFAR`/`HIFAR`.
#[inline]
pub fn faulting_ipa(hpfar: u32, far: u32) -> Address {
    Address((u64::from(hpfar & 0xFFFF_FFF0) << 8) | u64::from(far & 0xFFF))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_class_codes() {
        for class in ExceptionClass::ALL {
            assert_eq!(ExceptionClass::from(class.code()), class);
        }
        assert_eq!(ExceptionClass::from(0x02), ExceptionClass::Undefined(0x02));
        assert_eq!(ExceptionClass::from(0x3f).code(), 0x3f);
    }

    #[test]
    fn test_syndrome_fields() {
        // mcr p15, 0, r3, c2, c0, 1 (TTBR1), 32-bit, condition AL
        let hsr = HypSyndrome::from(0x01e2_0860_u32 | (0x03 << 26) | (1 << 25));
        assert_eq!(hsr.class(), ExceptionClass::Cp15_32);
        assert_eq!(hsr.instruction_length(), 4);
        let cp32 = hsr.cp32();
        assert!(!cp32.read());
        assert_eq!(cp32.rt().value(), 3);
        assert_eq!(
            cp32.access(),
            Cp15Access::Mcr {
                opc1: 0,
                crn: 2,
                crm: 0,
                opc2: 1
            }
        );
        assert_eq!(cp32.cond().value(), 0xe);
        assert!(cp32.cv());
    }

    #[test]
    fn test_data_abort_iss() {
        let iss = 0b1_00_0_00101_000000_0_0_0_1_001111_u32;
        let hsr = HypSyndrome::build(ExceptionClass::DataAbortLower, true, iss);
        let dabt = hsr.data_abort();
        assert!(dabt.isv());
        assert!(dabt.wnr());
        assert_eq!(dabt.srt().value(), 5);
        let status = FaultStatus::from(dabt.dfsc());
        assert_eq!(
            status,
            FaultStatus {
                fault: Fault::Permission,
                level: Some(3)
            }
        );
    }

    #[test]
    fn test_fault_status_codes() {
        for (fault, level) in [
            (Fault::Translation, 1),
            (Fault::AccessFlag, 2),
            (Fault::Permission, 3),
            (Fault::SyncExternalOnWalk, 2),
        ] {
            let status = FaultStatus::decode(fault.encode_ldfsc(level));
            assert_eq!(status.fault, fault);
            assert_eq!(status.level, Some(level));
        }
        assert_eq!(FaultStatus::decode(0b100001).fault, Fault::Alignment);
        assert_eq!(FaultStatus::decode(0b111110).fault, Fault::Reserved);
    }

    #[test]
    fn test_faulting_ipa() {
        assert_eq!(faulting_ipa(0x0040_0050, 0xdead_b804), Address(0x4000_5804));
        assert_eq!(faulting_ipa(0x00ff_ffff, 0), Address(0xffff_f000));
    }
}
