// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! Trap entry: route a syndrome to its handler.

use crate::{
    cpu_state::{GuestRegisters, HostCpu, ProcessorMode, SysReg, TvmAction},
    exceptions::{faulting_ipa, ExceptionClass, FaultStatus, HypSyndrome},
    machine::{HypercallOutcome, Hypervisor, RegisterWrite},
    memory::{Address, Permission, PAGE_SIZE},
};

/// Handler family of an exception class.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Route {
    RegisterAccess,
    Hypercall,
    InstructionAbort,
    DataAbort,
    Unhandled,
}

/// Handler for every `HSR.EC` value.
pub const ROUTES: [Route; 64] = {
    let mut routes = [Route::Unhandled; 64];
    routes[ExceptionClass::Cp15_32.code() as usize] = Route::RegisterAccess;
    routes[ExceptionClass::Cp15_64.code() as usize] = Route::RegisterAccess;
    routes[ExceptionClass::Hvc.code() as usize] = Route::Hypercall;
    routes[ExceptionClass::InstructionAbortLower.code() as usize] = Route::InstructionAbort;
    routes[ExceptionClass::DataAbortLower.code() as usize] = Route::DataAbort;
    routes
};

/// Why a stage 2 fault was not resolved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Denial {
    /// The page belongs to a protected region.
    ProtectedRegion,
    /// Privileged code tried to execute outside the vector window.
    PrivilegedExecute,
}

impl std::fmt::Display for Denial {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::ProtectedRegion => write!(fmt, "protected region"),
            Self::PrivilegedExecute => write!(fmt, "privileged execution outside vectors"),
        }
    }
}

/// How a trap was resolved, and where the guest resumes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// A register access was emulated and the guest resumes after it.
    /// `register` is `None` for encodings that are not virtualized.
    Emulated { register: Option<SysReg> },
    /// The guest resumes after its `HVC`.
    Hypercall(HypercallOutcome),
    /// The faulting page was remapped and the guest retries the access.
    Remapped { ipa: Address, permission: Permission },
    /// Nothing changed; the guest retries the access and faults again.
    Denied { ipa: Address, reason: Denial },
    /// Nothing emulated; the guest resumes after the trapping instruction.
    Skipped { class: ExceptionClass },
}

impl std::fmt::Display for TrapOutcome {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Emulated {
                register: Some(register),
            } => write!(fmt, "emulated {register} access"),
            Self::Emulated { register: None } => write!(fmt, "ignored register access"),
            Self::Hypercall(outcome) => write!(fmt, "hypercall: {outcome}"),
            Self::Remapped { ipa, permission } => write!(fmt, "remapped {ipa} {permission}"),
            Self::Denied { ipa, reason } => write!(fmt, "denied {ipa}: {reason}"),
            Self::Skipped { class } => write!(fmt, "skipped {class}"),
        }
    }
}

impl<C: HostCpu> Hypervisor<C> {
    /// Entry point of every trap to Hyp mode. `regs` is the guest state
    /// saved by the exception vector and restored when this returns.
    pub fn handle_trap(&mut self, regs: &mut GuestRegisters) -> TrapOutcome {
        let hsr = HypSyndrome::from(self.cpu.read_sysreg(SysReg::HSR) as u32);
        self.handle_syndrome(hsr, regs)
    }

    pub fn handle_syndrome(&mut self, hsr: HypSyndrome, regs: &mut GuestRegisters) -> TrapOutcome {
        self.stats.traps += 1;
        let class = hsr.class();
        log::trace!("Trap {class} ({hsr:?}) at pc 0x{:x}", regs.pc);
        match ROUTES[usize::from(hsr.ec().value())] {
            Route::RegisterAccess => self.handle_register_access(hsr, regs),
            Route::Hypercall => self.handle_hypercall(hsr, regs),
            Route::InstructionAbort => self.handle_instruction_abort(hsr, regs),
            Route::DataAbort => self.handle_data_abort(hsr, regs),
            Route::Unhandled => self.skip(hsr, regs),
        }
    }

    fn skip(&mut self, hsr: HypSyndrome, regs: &mut GuestRegisters) -> TrapOutcome {
        let class = hsr.class();
        log::debug!(
            "Resuming past unhandled {class} trap at pc 0x{:x}, HSR 0x{:08x}",
            regs.pc,
            u32::from(hsr)
        );
        *self.stats.unhandled.entry(class.to_string()).or_default() += 1;
        regs.advance_pc(hsr.instruction_length());
        TrapOutcome::Skipped { class }
    }

    fn handle_register_access(
        &mut self,
        hsr: HypSyndrome,
        regs: &mut GuestRegisters,
    ) -> TrapOutcome {
        let (access, read, rt, rt2) = if hsr.class() == ExceptionClass::Cp15_64 {
            let iss = hsr.cp64();
            (
                iss.access(),
                iss.read(),
                iss.rt().value(),
                Some(iss.rt2().value()),
            )
        } else {
            let iss = hsr.cp32();
            (iss.access(), iss.read(), iss.rt().value(), None)
        };
        let Some(&trapped) = self.trapped.lookup(&access) else {
            log::debug!("Ignoring trapped access to {access:?} at pc 0x{:x}", regs.pc);
            self.stats.ignored_register_accesses += 1;
            regs.advance_pc(hsr.instruction_length());
            return TrapOutcome::Emulated { register: None };
        };
        let register = trapped.register;

        if read {
            let value = self.cpu.read_sysreg(register);
            let written = match rt2 {
                None => regs.get_mut(rt).map(|r| *r = value as u32).is_some(),
                Some(rt2) => {
                    regs.get_mut(rt).map(|r| *r = value as u32).is_some()
                        && regs.get_mut(rt2).map(|r| *r = (value >> 32) as u32).is_some()
                }
            };
            if !written {
                return self.skip(hsr, regs);
            }
            self.stats.register_reads += 1;
        } else {
            let value = match rt2 {
                None => regs.get(rt).map(u64::from),
                Some(rt2) => regs
                    .get(rt)
                    .zip(regs.get(rt2))
                    .map(|(low, high)| (u64::from(high) << 32) | u64::from(low)),
            };
            let Some(value) = value else {
                return self.skip(hsr, regs);
            };
            match trapped.action {
                TvmAction::Write => self.cpu.write_sysreg(register, value),
                TvmAction::AuditedWrite => {
                    let old = self.cpu.read_sysreg(register);
                    self.cpu.write_sysreg(register, value);
                    self.record_write(RegisterWrite {
                        register,
                        old,
                        new: value,
                    });
                }
            }
            self.stats.register_writes += 1;
        }
        regs.advance_pc(hsr.instruction_length());
        TrapOutcome::Emulated {
            register: Some(register),
        }
    }

    fn handle_data_abort(&mut self, hsr: HypSyndrome, regs: &mut GuestRegisters) -> TrapOutcome {
        let iss = hsr.data_abort();
        let status = FaultStatus::from(iss.dfsc());
        let far = self.cpu.read_sysreg(SysReg::HDFAR) as u32;
        let ipa = faulting_ipa(self.cpu.read_sysreg(SysReg::HPFAR) as u32, far);
        if !status.is_permission() || !iss.wnr() || !self.tables.contains(ipa) {
            log::debug!("{status:?} on {ipa} (va 0x{far:x}) is not a write permission fault");
            return self.skip(hsr, regs);
        }
        if self.protection.overlaps(ipa.page_floor(), PAGE_SIZE) {
            log::warn!(
                "Denied write to protected {ipa} (va 0x{far:x}) at pc 0x{:x}",
                regs.pc
            );
            self.stats.denied += 1;
            return TrapOutcome::Denied {
                ipa,
                reason: Denial::ProtectedRegion,
            };
        }
        self.stats.remapped_writable += 1;
        self.remap(ipa, Address(far.into()), Permission::ReadWrite)
    }

    fn handle_instruction_abort(
        &mut self,
        hsr: HypSyndrome,
        regs: &mut GuestRegisters,
    ) -> TrapOutcome {
        let iss = hsr.instruction_abort();
        let status = FaultStatus::from(iss.ifsc());
        let far = self.cpu.read_sysreg(SysReg::HIFAR) as u32;
        let ipa = faulting_ipa(self.cpu.read_sysreg(SysReg::HPFAR) as u32, far);
        if !status.is_permission() || !self.tables.contains(ipa) {
            log::debug!("{status:?} on {ipa} (va 0x{far:x}) is not an execute permission fault");
            return self.skip(hsr, regs);
        }
        let reason = if self.protection.overlaps(ipa.page_floor(), PAGE_SIZE) {
            Some(Denial::ProtectedRegion)
        } else if regs.mode() != ProcessorMode::User
            && !self.config.vector_window.contains(Address(far.into()))
        {
            Some(Denial::PrivilegedExecute)
        } else {
            None
        };
        if let Some(reason) = reason {
            log::warn!(
                "Denied execution of {ipa} (va 0x{far:x}) in {:?} mode: {reason}",
                regs.mode()
            );
            self.stats.denied += 1;
            return TrapOutcome::Denied { ipa, reason };
        }
        self.stats.remapped_executable += 1;
        self.remap(ipa, Address(far.into()), Permission::ReadExecute)
    }

    fn remap(&mut self, ipa: Address, va: Address, permission: Permission) -> TrapOutcome {
        let ipa = ipa.page_floor();
        self.tables.set_permission(ipa, PAGE_SIZE, permission);
        self.flush_page(va);
        log::debug!("Remapped {ipa} (va {va}) {permission}");
        TrapOutcome::Remapped { ipa, permission }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        assert_eq!(ROUTES[0x03], Route::RegisterAccess);
        assert_eq!(ROUTES[0x04], Route::RegisterAccess);
        assert_eq!(ROUTES[0x12], Route::Hypercall);
        assert_eq!(ROUTES[0x20], Route::InstructionAbort);
        assert_eq!(ROUTES[0x24], Route::DataAbort);
        // Aborts taken from Hyp mode itself are not the guest's.
        assert_eq!(ROUTES[0x21], Route::Unhandled);
        assert_eq!(ROUTES[0x25], Route::Unhandled);
        assert_eq!(ROUTES[0x01], Route::Unhandled);
        assert_eq!(ROUTES[0x3f], Route::Unhandled);
        assert_eq!(
            ROUTES.iter().filter(|r| **r != Route::Unhandled).count(),
            5
        );
    }
}
