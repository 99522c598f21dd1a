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

//! Trap-and-emulate hypervisor core for ARMv7 with the Virtualization
//! Extensions. Guest physical memory is mapped by LPAE stage 2 tables whose
//! permissions never allow a page to be both writable and executable, and
//! guest kernel regions, once protected, never become writable again.

pub mod cli;
pub mod config;
pub mod cpu_state;
pub mod exceptions;
pub mod machine;
pub mod memory;
