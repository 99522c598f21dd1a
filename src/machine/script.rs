// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the wxvisor project.

//! Replay of guest operations described in JSON.
//!
//! ```json
//! { "operations": [
//!     { "op": "hvc", "call": 1, "r0": 1073745920, "r1": 8192 },
//!     { "op": "hvc", "call": 3 },
//!     { "op": "write", "address": 1073745920 },
//!     { "op": "mcr", "register": "SCTLR", "value": 12912761 }
//! ] }
//! ```

use std::path::Path;

use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};

use crate::{
    cpu_state::{Cp15Access, ProcessorMode, SysReg},
    machine::{
        guest::{Access, Guest},
        RegisterWrite, TrapOutcome, TrapStatistics,
    },
    memory::{Address, ProtectionRegion},
};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestMode {
    User,
    #[default]
    Supervisor,
}

impl From<GuestMode> for ProcessorMode {
    fn from(mode: GuestMode) -> Self {
        match mode {
            GuestMode::User => Self::User,
            GuestMode::Supervisor => Self::Supervisor,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Read {
        address: Address,
    },
    Write {
        address: Address,
    },
    Execute {
        address: Address,
        #[serde(default)]
        mode: GuestMode,
    },
    /// Map a guest virtual page to an intermediate physical page.
    Map {
        va: Address,
        ipa: Address,
    },
    Hvc {
        call: u16,
        #[serde(default)]
        r0: u32,
        #[serde(default)]
        r1: u32,
    },
    /// `MCR`/`MCRR` of a known register.
    Mcr {
        register: SysReg,
        value: u64,
    },
    /// `MRC`/`MRRC` of a known register.
    Mrc {
        register: SysReg,
    },
    /// Trapped CP15 access by raw encoding.
    Cp15 {
        opc1: u8,
        crn: u8,
        crm: u8,
        opc2: u8,
        #[serde(default)]
        read: bool,
        #[serde(default)]
        rt: u8,
    },
    /// Trap with an arbitrary syndrome.
    Raw {
        hsr: u32,
        #[serde(default)]
        hdfar: u32,
        #[serde(default)]
        hifar: u32,
        #[serde(default)]
        hpfar: u32,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    pub operations: Vec<Operation>,
}

#[derive(Debug)]
pub enum ScriptError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(fmt, "could not read script: {err}"),
            Self::Json(err) => write!(fmt, "invalid script: {err}"),
        }
    }
}

impl std::error::Error for ScriptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for ScriptError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for ScriptError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

/// What happened to one operation.
#[derive(Clone, Debug, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub operation: Operation,
    /// For memory accesses, whether the access went through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    /// For register reads, the value the guest got.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    pub traps: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub steps: Vec<StepReport>,
    pub statistics: TrapStatistics,
    pub enforcing: bool,
    pub protected_regions: Vec<ProtectionRegion>,
    pub audit_log: Vec<RegisterWrite>,
    /// Number of guest RAM pages per permission.
    pub pages: IndexMap<String, usize>,
}

fn accessed(access: Access) -> (Option<bool>, Option<u64>, Vec<TrapOutcome>) {
    (Some(access.completed), None, access.traps)
}

impl Script {
    pub fn from_json(input: &str) -> Result<Self, ScriptError> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ScriptError> {
        let input = std::fs::read_to_string(path)?;
        Self::from_json(&input)
    }

    /// Run every operation in order on `guest`.
    pub fn replay(&self, guest: &mut Guest) -> Report {
        let steps = self
            .operations
            .iter()
            .enumerate()
            .map(|(step, operation)| {
                log::debug!("Step {step}: {operation:?}");
                let (completed, value, traps) = match *operation {
                    Operation::Read { address } => accessed(guest.read(address)),
                    Operation::Write { address } => accessed(guest.write(address)),
                    Operation::Execute { address, mode } => {
                        accessed(guest.execute(address, mode.into()))
                    }
                    Operation::Map { va, ipa } => {
                        guest.map(va, ipa);
                        (None, None, vec![])
                    }
                    Operation::Hvc { call, r0, r1 } => (None, None, vec![guest.hvc(call, r0, r1)]),
                    Operation::Mcr { register, value } => (
                        None,
                        None,
                        guest.write_register(register, value).into_iter().collect(),
                    ),
                    Operation::Mrc { register } => {
                        (None, Some(guest.read_register(register)), vec![])
                    }
                    Operation::Cp15 {
                        opc1,
                        crn,
                        crm,
                        opc2,
                        read,
                        rt,
                    } => {
                        let access = Cp15Access::Mcr {
                            opc1,
                            crn,
                            crm,
                            opc2,
                        };
                        (None, None, vec![guest.cp15(access, read, rt, 0)])
                    }
                    Operation::Raw {
                        hsr,
                        hdfar,
                        hifar,
                        hpfar,
                    } => (None, None, vec![guest.raw_trap(hsr, hdfar, hifar, hpfar)]),
                };
                StepReport {
                    step,
                    operation: operation.clone(),
                    completed,
                    value,
                    traps: traps.iter().map(ToString::to_string).collect(),
                }
            })
            .collect();

        let hypervisor = &guest.hypervisor;
        let mut pages = IndexMap::new();
        for (_, descriptor) in hypervisor.tables().pages() {
            *pages
                .entry(descriptor.permission().to_string())
                .or_default() += 1;
        }
        Report {
            steps,
            statistics: hypervisor.stats().clone(),
            enforcing: hypervisor.is_enforcing(),
            protected_regions: hypervisor.protection().iter().copied().collect(),
            audit_log: hypervisor.audit_log().copied().collect(),
            pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script() {
        let script = Script::from_json(
            r#"{ "operations": [
                { "op": "hvc", "call": 1, "r0": 4096, "r1": 8192 },
                { "op": "execute", "address": 4096, "mode": "user" },
                { "op": "mcr", "register": "TTBR0_64", "value": 1 },
                { "op": "read", "address": 20480 }
            ] }"#,
        )
        .unwrap();
        assert_eq!(
            script.operations[0],
            Operation::Hvc {
                call: 1,
                r0: 0x1000,
                r1: 0x2000
            }
        );
        assert_eq!(
            script.operations[1],
            Operation::Execute {
                address: Address(0x1000),
                mode: GuestMode::User
            }
        );
        assert_eq!(
            script.operations[2],
            Operation::Mcr {
                register: SysReg::TTBR0_64,
                value: 1
            }
        );
        assert!(matches!(
            Script::from_json(r#"{ "operations": [{ "op": "jump" }] }"#),
            Err(ScriptError::Json(_))
        ));
    }
}
