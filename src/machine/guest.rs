// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! A guest driving the hypervisor through the traps the hardware would
//! raise for its accesses.
//!
//! Stage 1 translation is the identity unless a page is remapped with
//! [`Guest::map`]. Accesses consult the simulated TLB before walking the
//! stage 2 tables, so a handler that forgets to invalidate a stale
//! translation makes the access fault again.

use bilge::prelude::*;
use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};

use crate::{
    config::{ConfigError, PlatformConfig},
    cpu_state::{Cp15Access, GuestRegisters, HypConfiguration, ProcessorMode, SysReg},
    exceptions::{
        Cp32Iss, Cp64Iss, DataAbortIss, ExceptionClass, Fault, HvcIss, HypSyndrome,
        InstructionAbortIss,
    },
    machine::{
        simulated::SimulatedCpu,
        tlb::TlbEntry,
        Hypervisor, TrapOutcome,
    },
    memory::{Address, Permission},
};

/// How many times an access is retried after its fault was resolved.
pub const MAX_FAULT_RETRIES: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    pub const fn is_allowed(self, perm: Permission) -> bool {
        match self {
            Self::Read => perm.read(),
            Self::Write => perm.write(),
            Self::Execute => !perm.execute_never(),
        }
    }
}

/// Result of a guest memory access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Access {
    /// Whether the access eventually went through.
    pub completed: bool,
    /// Traps taken on the way, in order.
    pub traps: Vec<TrapOutcome>,
}

#[derive(Copy, Clone, Debug)]
struct StageTwoFault {
    fault: Fault,
    level: u8,
    ipa: Address,
}

#[derive(Debug)]
pub struct Guest {
    pub hypervisor: Hypervisor<SimulatedCpu>,
    pub regs: GuestRegisters,
    stage1: FxHashMap<u64, u64>,
}

impl Guest {
    pub fn new(hypervisor: Hypervisor<SimulatedCpu>) -> Self {
        let mut regs = GuestRegisters {
            pc: hypervisor.tables().layout().ram_base().0 as u32,
            ..GuestRegisters::default()
        };
        regs.set_mode(ProcessorMode::Supervisor);
        Self {
            hypervisor,
            regs,
            stage1: FxHashMap::default(),
        }
    }

    /// Boot a hypervisor on a fresh simulated core.
    pub fn boot(config: PlatformConfig) -> Result<Self, ConfigError> {
        Hypervisor::boot(SimulatedCpu::new(), config).map(Self::new)
    }

    /// Map the guest virtual page of `va` to the page of `ipa`.
    pub fn map(&mut self, va: Address, ipa: Address) {
        self.stage1.insert(va.page_floor().0, ipa.page_floor().0);
        self.hypervisor.cpu.tlb.invalidate(va);
    }

    /// Stage 1 translation of `va`.
    pub fn stage1(&self, va: Address) -> Address {
        self.stage1
            .get(&va.page_floor().0)
            .map_or(va, |page| Address(page | va.page_offset()))
    }

    /// Current address space identifier, `CONTEXTIDR.ASID`.
    pub fn asid(&self) -> u8 {
        (self.hypervisor.cpu.register(SysReg::CONTEXTIDR) & 0xff) as u8
    }

    pub fn read(&mut self, va: Address) -> Access {
        self.access(va, AccessKind::Read)
    }

    pub fn write(&mut self, va: Address) -> Access {
        self.access(va, AccessKind::Write)
    }

    /// Fetch an instruction at `va` in `mode`.
    pub fn execute(&mut self, va: Address, mode: ProcessorMode) -> Access {
        self.regs.set_mode(mode);
        self.regs.pc = va.0 as u32;
        self.access(va, AccessKind::Execute)
    }

    pub fn access(&mut self, va: Address, kind: AccessKind) -> Access {
        let mut traps = vec![];
        for _ in 0..=MAX_FAULT_RETRIES {
            let Err(fault) = self.check(va, kind) else {
                return Access {
                    completed: true,
                    traps,
                };
            };
            self.raise_abort(va, kind, fault);
            let pc = self.regs.pc;
            let outcome = self.hypervisor.handle_trap(&mut self.regs);
            traps.push(outcome);
            if self.regs.pc != pc || !matches!(outcome, TrapOutcome::Remapped { .. }) {
                break;
            }
        }
        log::debug!("{kind:?} access of {va} did not complete: {traps:?}");
        Access {
            completed: false,
            traps,
        }
    }

    fn check(&mut self, va: Address, kind: AccessKind) -> Result<(), StageTwoFault> {
        let ipa = self.stage1(va);
        let asid = self.asid();
        let entry = match self.hypervisor.cpu.tlb.get(asid, va) {
            Some(entry) => entry,
            None => {
                let Some(translation) = self.hypervisor.tables().translate(ipa) else {
                    return Err(StageTwoFault {
                        fault: Fault::Translation,
                        level: 1,
                        ipa,
                    });
                };
                let entry = TlbEntry {
                    ipa: ipa.page_floor(),
                    permission: translation.permission,
                };
                self.hypervisor.cpu.tlb.insert(asid, va, entry);
                entry
            }
        };
        if kind.is_allowed(entry.permission) {
            return Ok(());
        }
        Err(StageTwoFault {
            fault: Fault::Permission,
            level: if self.hypervisor.tables().contains(ipa) {
                3
            } else {
                1
            },
            ipa,
        })
    }

    fn raise_abort(&mut self, va: Address, kind: AccessKind, fault: StageTwoFault) {
        let fsc = u6::new(fault.fault.encode_ldfsc(fault.level));
        let hsr = if kind == AccessKind::Execute {
            let mut iss = InstructionAbortIss::from(u25::new(0));
            iss.set_ifsc(fsc);
            self.hypervisor.cpu.set_register(SysReg::HIFAR, va.0);
            HypSyndrome::build(
                ExceptionClass::InstructionAbortLower,
                true,
                u25::from(iss).value(),
            )
        } else {
            let mut iss = DataAbortIss::from(u25::new(0));
            iss.set_dfsc(fsc);
            iss.set_wnr(kind == AccessKind::Write);
            self.hypervisor.cpu.set_register(SysReg::HDFAR, va.0);
            HypSyndrome::build(ExceptionClass::DataAbortLower, true, u25::from(iss).value())
        };
        self.hypervisor
            .cpu
            .set_register(SysReg::HPFAR, (fault.ipa.0 >> 8) & 0xFFFF_FFF0);
        self.hypervisor.cpu.set_register(SysReg::HSR, u32::from(hsr).into());
    }

    /// Issue `HVC #call` with `r0` and `r1` as arguments.
    pub fn hvc(&mut self, call: u16, r0: u32, r1: u32) -> TrapOutcome {
        self.regs.r[0] = r0;
        self.regs.r[1] = r1;
        // HVC returns to the next instruction.
        self.regs.advance_pc(4);
        let mut iss = HvcIss::from(u25::new(0));
        iss.set_imm16(call);
        let hsr = HypSyndrome::build(ExceptionClass::Hvc, true, u25::from(iss).value());
        self.trap(hsr)
    }

    /// Write a control register. The write only traps while `HCR.TVM` is set;
    /// otherwise it goes straight to the register and `None` is returned.
    pub fn write_register(&mut self, reg: SysReg, value: u64) -> Option<TrapOutcome> {
        let hcr = HypConfiguration::from_bits_retain(
            self.hypervisor.cpu.register(SysReg::HCR) as u32,
        );
        if !hcr.contains(HypConfiguration::TVM) {
            self.hypervisor.cpu.set_register(reg, value);
            self.regs.advance_pc(4);
            return None;
        }
        self.regs.r[0] = value as u32;
        self.regs.r[1] = (value >> 32) as u32;
        Some(self.cp15(reg.encoding(), false, 0, 1))
    }

    /// Read a control register. Reads never trap.
    pub fn read_register(&mut self, reg: SysReg) -> u64 {
        self.regs.advance_pc(4);
        self.hypervisor.cpu.register(reg)
    }

    /// Trap a CP15 access with transfer registers `rt` (and `rt2` for 64-bit
    /// accesses).
    pub fn cp15(&mut self, access: Cp15Access, read: bool, rt: u8, rt2: u8) -> TrapOutcome {
        let hsr = match access {
            Cp15Access::Mcr {
                opc1,
                crn,
                crm,
                opc2,
            } => {
                let mut iss = Cp32Iss::from(u25::new(0));
                iss.set_read(read);
                iss.set_crm(u4::new(crm & 0xf));
                iss.set_rt(u5::new(rt & 0x1f));
                iss.set_crn(u4::new(crn & 0xf));
                iss.set_opc1(u3::new(opc1 & 0x7));
                iss.set_opc2(u3::new(opc2 & 0x7));
                iss.set_cond(u4::new(0b1110));
                iss.set_cv(true);
                HypSyndrome::build(ExceptionClass::Cp15_32, true, u25::from(iss).value())
            }
            Cp15Access::Mcrr { opc1, crm } => {
                let mut iss = Cp64Iss::from(u25::new(0));
                iss.set_read(read);
                iss.set_crm(u4::new(crm & 0xf));
                iss.set_rt(u5::new(rt & 0x1f));
                iss.set_rt2(u5::new(rt2 & 0x1f));
                iss.set_opc1(u4::new(opc1 & 0xf));
                iss.set_cond(u4::new(0b1110));
                iss.set_cv(true);
                HypSyndrome::build(ExceptionClass::Cp15_64, true, u25::from(iss).value())
            }
        };
        self.trap(hsr)
    }

    /// Take a trap with the given syndrome and fault address registers.
    pub fn raw_trap(&mut self, hsr: u32, hdfar: u32, hifar: u32, hpfar: u32) -> TrapOutcome {
        let cpu = &mut self.hypervisor.cpu;
        cpu.set_register(SysReg::HDFAR, hdfar.into());
        cpu.set_register(SysReg::HIFAR, hifar.into());
        cpu.set_register(SysReg::HPFAR, hpfar.into());
        self.trap(HypSyndrome::from(hsr))
    }

    fn trap(&mut self, hsr: HypSyndrome) -> TrapOutcome {
        self.hypervisor
            .cpu
            .set_register(SysReg::HSR, u32::from(hsr).into());
        self.hypervisor.handle_trap(&mut self.regs)
    }
}
