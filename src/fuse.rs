// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Burn the allocated MAC into one-time-programmable fuses.
// Author: Lukas Bower

//! Fuse programmer.
//!
//! Fuses cannot be rolled back, so every sub-step is verified on its own and
//! any missing marker aborts the whole sequence with the exact step named.
//! An uncertain outcome after a confirmed write is [`ProvisionError::FuseWriteFailed`]
//! and must never be retried blindly.

use std::fmt;

use log::info;

use crate::error::{ProvisionError, Result};
use crate::mac::MacAddr;
use crate::policy::BootloaderPolicy;
use crate::serial::SerialSession;
use crate::uboot::PROMPT_MARKER;

/// Interactive safety prompt the bootloader raises before programming.
pub const CONFIRM_MARKER: &str = "Really perform this fuse programming?";
/// Full success message for the bootloader's environment save to MMC. A
/// short substring would false-match unrelated output.
pub const ENV_SAVE_MARKER: &str = "Saving Environment to MMC... OK";

/// Fuse bank holding the MAC words.
const MAC_BANK: u32 = 4;
/// Word index of the 32-bit low half (octets 2-5).
const LOW_WORD: u32 = 2;
/// Word index of the 16-bit high half (octets 0-1).
const HIGH_WORD: u32 = 3;

/// Independently verified sub-steps of the burn sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseStep {
    /// Program the 32-bit low word.
    LowWord,
    /// Program the 16-bit high word.
    HighWord,
    /// Point the runtime environment MAC at the fused value.
    RuntimeEnv,
    /// Persist the environment so the OS sees the MAC immediately.
    PersistEnv,
}

impl fmt::Display for FuseStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::LowWord => "low-word",
            Self::HighWord => "high-word",
            Self::RuntimeEnv => "runtime-env",
            Self::PersistEnv => "persist-env",
        };
        f.write_str(label)
    }
}

/// Programs an already-claimed MAC at the bootloader prompt. The programmer
/// never invents addresses; its input comes from the allocation coordinator.
pub struct FuseProgrammer<'a> {
    session: &'a mut SerialSession,
    timing: &'a BootloaderPolicy,
}

impl<'a> FuseProgrammer<'a> {
    /// Wrap the session and timing policy.
    pub fn new(session: &'a mut SerialSession, timing: &'a BootloaderPolicy) -> Self {
        Self { session, timing }
    }

    /// Burn both fuse words, set and persist the environment MAC, then reset
    /// the target without waiting for a response (the console is expected to
    /// disappear).
    pub fn burn(&mut self, mac: &MacAddr) -> Result<()> {
        let words = mac.fuse_words();
        info!(
            "burning {mac} as high=0x{high:04x} low=0x{low:08x}",
            high = words.high,
            low = words.low
        );
        self.program_word(FuseStep::LowWord, LOW_WORD, &format!("0x{:08x}", words.low))?;
        self.program_word(FuseStep::HighWord, HIGH_WORD, &format!("0x{:04x}", words.high))?;
        self.set_runtime_mac(mac)?;
        self.session.send_line("reset")?;
        Ok(())
    }

    /// One fuse word: issue the program command, answer the interactive
    /// confirmation, then require the completion marker. The prompt only
    /// returns after the write finishes, so its reappearance after a clean
    /// buffer reset is the completion signal.
    fn program_word(&mut self, step: FuseStep, word: u32, value: &str) -> Result<()> {
        self.session.reset()?;
        self.session
            .send_line(&format!("fuse prog {MAC_BANK} {word} {value}"))?;
        let confirmed = self
            .session
            .wait_for(&[CONFIRM_MARKER], self.timing.confirm_timeout())?;
        if confirmed.is_none() {
            return Err(ProvisionError::FuseConfirmationTimeout { step });
        }
        self.session.reset()?;
        self.session.send_line("y")?;
        let done = self
            .session
            .wait_for(&[PROMPT_MARKER], self.timing.write_timeout())?;
        if done.is_none() {
            return Err(ProvisionError::FuseWriteFailed { step });
        }
        info!("fuse step {step} complete");
        Ok(())
    }

    /// Point `ethaddr` at the fused value and persist it, so the OS-visible
    /// MAC matches the fuses on the very next boot.
    fn set_runtime_mac(&mut self, mac: &MacAddr) -> Result<()> {
        self.session.reset()?;
        self.session.send_line(&format!("setenv ethaddr {mac}"))?;
        let accepted = self
            .session
            .wait_for(&[PROMPT_MARKER], self.timing.env_timeout())?;
        if accepted.is_none() {
            return Err(ProvisionError::FuseWriteFailed {
                step: FuseStep::RuntimeEnv,
            });
        }
        self.session.reset()?;
        self.session.send_line("saveenv")?;
        let saved = self
            .session
            .wait_for(&[ENV_SAVE_MARKER], self.timing.env_timeout())?;
        if saved.is_none() {
            return Err(ProvisionError::FuseWriteFailed {
                step: FuseStep::PersistEnv,
            });
        }
        Ok(())
    }
}
