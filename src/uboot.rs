// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Force the target into its secondary bootloader prompt.
// Author: Lukas Bower

//! Bootloader bridge.
//!
//! Entering the bootloader means winning a race: the interrupt keystroke has
//! to land while the autoboot countdown is still open. The bridge
//! power-cycles, then fires the keystroke at a fixed short interval for a
//! bounded number of attempts while scanning for the literal interactive
//! prompt. A miss is [`ProvisionError::BootInterruptMissed`] and is expected
//! to happen occasionally; the orchestrator answers it with another power
//! cycle, up to its configured cap.

use log::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::policy::BootloaderPolicy;
use crate::serial::SerialSession;
use crate::station::PowerControl;

/// Countdown banner printed while autoboot is still interruptible.
pub const AUTOBOOT_MARKER: &str = "Hit any key to stop autoboot";
/// Success message for the bootloader's environment load from MMC.
pub const ENV_LOAD_MARKER: &str = "Loading Environment from MMC... OK";
/// Literal interactive bootloader prompt. Entry is declared on this marker
/// alone, never inferred from silence.
pub const PROMPT_MARKER: &str = "=> ";

/// Keystroke raced against the countdown.
const INTERRUPT_KEY: &[u8] = b" ";

/// Drives one bootloader-entry attempt over an exclusive session.
pub struct BootloaderBridge<'a> {
    session: &'a mut SerialSession,
    timing: &'a BootloaderPolicy,
}

impl<'a> BootloaderBridge<'a> {
    /// Wrap the session and timing policy.
    pub fn new(session: &'a mut SerialSession, timing: &'a BootloaderPolicy) -> Self {
        Self { session, timing }
    }

    /// Power-cycle the target and race the interrupt keystroke against the
    /// autoboot countdown. Returns only once the interactive prompt marker
    /// has been observed.
    pub fn enter(&mut self, power: &mut dyn PowerControl) -> Result<()> {
        power.cycle()?;
        self.session.reset()?;

        let attempts = self.timing.interrupt_attempts;
        let mut countdown_seen = false;
        for attempt in 1..=attempts {
            self.session.send_raw(INTERRUPT_KEY)?;
            self.session.pump(self.timing.interrupt_interval())?;
            let buffer = self.session.buffer();
            if buffer.contains(PROMPT_MARKER) {
                info!("bootloader prompt captured on attempt {attempt}");
                return Ok(());
            }
            if !countdown_seen
                && (buffer.contains(AUTOBOOT_MARKER) || buffer.contains(ENV_LOAD_MARKER))
            {
                debug!("autoboot countdown open on attempt {attempt}");
                countdown_seen = true;
            }
        }
        if countdown_seen {
            warn!("countdown was open but the prompt never surfaced");
        }
        Err(ProvisionError::BootInterruptMissed { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::BootloaderPolicy;
    use crate::serial::{ScriptedPort, SerialSession};
    use crate::station::PowerControl;
    use std::time::Duration;

    struct NullPower;

    impl PowerControl for NullPower {
        fn power_on(&mut self) -> Result<()> {
            Ok(())
        }
        fn power_off(&mut self) -> Result<()> {
            Ok(())
        }
        fn cycle(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn fast_timing() -> BootloaderPolicy {
        BootloaderPolicy {
            interrupt_interval_ms: 1,
            interrupt_attempts: 5,
            ..BootloaderPolicy::default()
        }
    }

    #[test]
    fn declares_entry_only_on_prompt_marker() {
        let port = ScriptedPort::new()
            .emit("U-Boot 2020.04\r\n")
            .emit(AUTOBOOT_MARKER)
            .emit("\r\n=> ");
        let mut session = SerialSession::new(Box::new(port), Duration::from_millis(1));
        let timing = fast_timing();
        let mut bridge = BootloaderBridge::new(&mut session, &timing);
        bridge.enter(&mut NullPower).unwrap();
    }

    #[test]
    fn missed_race_reports_interrupt_missed() {
        let port = ScriptedPort::new()
            .emit(AUTOBOOT_MARKER)
            .emit("Starting kernel ...\r\n");
        let mut session = SerialSession::new(Box::new(port), Duration::from_millis(1));
        let timing = fast_timing();
        let mut bridge = BootloaderBridge::new(&mut session, &timing);
        let err = bridge.enter(&mut NullPower).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::BootInterruptMissed { attempts: 5 }
        ));
    }
}
