// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! Guest requests made with `HVC #imm16`.
//!
//! Protection calls take the region base in `r0` and its size in `r1`.

use crate::{
    cpu_state::{GuestRegisters, HostCpu},
    exceptions::HypSyndrome,
    machine::{Hypervisor, TrapOutcome},
    memory::{Address, MemorySize, Permission, ProtectionError, ProtectionRegion},
};

#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HypercallId {
    /// Does nothing.
    Nop = 0,
    /// Pin `[r0, r0 + r1)` read-execute.
    ProtectExecutable = 1,
    /// Pin `[r0, r0 + r1)` read-only.
    ProtectReadOnly = 2,
    /// Seal the protection registry.
    EnableProtection = 3,
    Unknown = 0xFFFF,
}

impl From<u16> for HypercallId {
    fn from(val: u16) -> Self {
        match val {
            v if v == Self::Nop as u16 => Self::Nop,
            v if v == Self::ProtectExecutable as u16 => Self::ProtectExecutable,
            v if v == Self::ProtectReadOnly as u16 => Self::ProtectReadOnly,
            v if v == Self::EnableProtection as u16 => Self::EnableProtection,
            _ => Self::Unknown,
        }
    }
}

/// Why a protection request was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HypercallError {
    EmptyRange { base: Address },
    OutOfRange { base: Address, size: MemorySize },
    Protection(ProtectionError),
}

impl std::fmt::Display for HypercallError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::EmptyRange { base } => write!(fmt, "empty range at {base}"),
            Self::OutOfRange { base, size } => {
                write!(fmt, "range {base}+{size} is outside guest RAM")
            }
            Self::Protection(err) => write!(fmt, "{err}"),
        }
    }
}

impl std::error::Error for HypercallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protection(err) => Some(err),
            Self::EmptyRange { .. } | Self::OutOfRange { .. } => None,
        }
    }
}

impl From<ProtectionError> for HypercallError {
    fn from(err: ProtectionError) -> Self {
        Self::Protection(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HypercallOutcome {
    Nop,
    Protected {
        region: ProtectionRegion,
        pages: usize,
    },
    /// Enforcement is on; `already` is set for repeated requests.
    Enforcing { already: bool },
    Rejected { call: u16, error: HypercallError },
    Unknown { call: u16 },
}

impl std::fmt::Display for HypercallOutcome {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Nop => write!(fmt, "nop"),
            Self::Protected { region, pages } => {
                write!(fmt, "protected {region}, {pages} page(s)")
            }
            Self::Enforcing { already: false } => write!(fmt, "protection enforced"),
            Self::Enforcing { already: true } => write!(fmt, "protection already enforced"),
            Self::Rejected { call, error } => write!(fmt, "call {call} rejected: {error}"),
            Self::Unknown { call } => write!(fmt, "unknown call {call}"),
        }
    }
}

impl<C: HostCpu> Hypervisor<C> {
    pub(super) fn handle_hypercall(
        &mut self,
        hsr: HypSyndrome,
        regs: &mut GuestRegisters,
    ) -> TrapOutcome {
        let call = hsr.hvc().imm16();
        self.stats.hypercalls += 1;
        // The preferred return address of HVC is the next instruction, so
        // the saved PC is left alone.
        let outcome = match HypercallId::from(call) {
            HypercallId::Nop => HypercallOutcome::Nop,
            HypercallId::ProtectExecutable => {
                self.protect_range(call, regs, Permission::ReadExecute)
            }
            HypercallId::ProtectReadOnly => self.protect_range(call, regs, Permission::ReadOnly),
            HypercallId::EnableProtection => self.enable_protection(),
            HypercallId::Unknown => {
                log::warn!("Unknown hypercall {call} at pc 0x{:x}", regs.pc);
                self.stats.rejected_hypercalls += 1;
                HypercallOutcome::Unknown { call }
            }
        };
        TrapOutcome::Hypercall(outcome)
    }

    fn protect_range(
        &mut self,
        call: u16,
        regs: &GuestRegisters,
        permission: Permission,
    ) -> HypercallOutcome {
        let base = Address(regs.r[0].into());
        match self.try_protect_range(base, regs.r[1].into(), permission) {
            Ok((region, pages)) => HypercallOutcome::Protected { region, pages },
            Err(error) => {
                if matches!(
                    error,
                    HypercallError::Protection(ProtectionError::CapacityExceeded { .. })
                ) {
                    log::error!("Hypercall {call}: {error}");
                } else {
                    log::warn!("Hypercall {call}: {error}");
                }
                self.stats.rejected_hypercalls += 1;
                HypercallOutcome::Rejected { call, error }
            }
        }
    }

    fn try_protect_range(
        &mut self,
        base: Address,
        size: u64,
        permission: Permission,
    ) -> Result<(ProtectionRegion, usize), HypercallError> {
        let size = MemorySize::new(size).ok_or(HypercallError::EmptyRange { base })?;
        let region = ProtectionRegion {
            base,
            size,
            permission,
        };
        if self.protection.is_sealed() {
            return Err(ProtectionError::Sealed { region }.into());
        }
        let layout = self.tables.layout();
        if !layout.contains(base) || !layout.contains(Address(region.end().0 - 1)) {
            return Err(HypercallError::OutOfRange { base, size });
        }
        let pages = self.protect(region)?;
        self.flush_all();
        Ok((region, pages))
    }

    fn enable_protection(&mut self) -> HypercallOutcome {
        if self.protection.is_sealed() {
            log::debug!("Protection is already enforced");
            return HypercallOutcome::Enforcing { already: true };
        }
        self.protection.seal();
        self.flush_all();
        log::info!(
            "Protection enforced with {} region(s)",
            self.protection.len()
        );
        HypercallOutcome::Enforcing { already: false }
    }
}
