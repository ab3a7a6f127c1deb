// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Library surface of the forgebench provisioning station.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Factory provisioning for embedded Linux gateway boards.
//!
//! A forgebench station drives one board at a time over its serial console:
//! boot and login, OS flashing, and permanent MAC fuse programming. MACs come
//! from a shared git-backed inventory that many stations mutate concurrently
//! with no central allocator; claims are optimistic and verified after the
//! merge lands. The console is an unframed byte stream, so every wait in the
//! crate is a poll-and-accumulate pattern match, never a line read.

pub mod allocate;
pub mod boot;
pub mod error;
pub mod fuse;
pub mod gitledger;
pub mod ledger;
pub mod mac;
pub mod policy;
pub mod run;
pub mod serial;
pub mod station;
pub mod uboot;

pub use allocate::{AllocationOutcome, Allocator};
pub use boot::{BootAutomaton, BootState};
pub use error::{ProvisionError, Result};
pub use fuse::{FuseProgrammer, FuseStep};
pub use gitledger::GitClaimStore;
pub use ledger::{AllocationClaim, Assignment, ClaimStore, Ledger, MacRecord};
pub use mac::{FuseWords, MacAddr};
pub use policy::{PolicyOverrides, StationPolicy};
pub use run::{ProvisionRun, RunError, RunSummary, Step};
pub use serial::{ConsolePort, ScriptedPort, SentLog, SerialSession, TtyPort};
pub use station::{PowerControl, ShellPower, StatusPanel};
pub use uboot::BootloaderBridge;
