// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive the target from power-on to an authenticated shell.
// Author: Lukas Bower

//! Boot and login automaton.
//!
//! State only advances on pattern matches against newly read console bytes.
//! Each operation performs exactly one deterministic pass with a fixed
//! ceiling; bounded retry policy (power-cycle and start over) belongs to the
//! orchestration layer, never here.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::policy::{ConsolePolicy, Credentials};
use crate::serial::SerialSession;
use crate::station::PowerControl;

/// Suffix printed by getty when the target wants a login name.
pub const LOGIN_PROMPT: &str = "login:";
/// Root shell prompt.
pub const ROOT_PROMPT: &str = "# ";
/// Unprivileged shell prompt.
pub const USER_PROMPT: &str = "$ ";
/// Password prompt, matched case-insensitively on the first letter.
const PASSWORD_PROMPTS: [&str; 2] = ["Password:", "password:"];

/// Observable target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    /// Power collaborator reports the board off.
    PoweredOff,
    /// Power applied, no shell marker observed yet.
    Booting,
    /// Login prompt observed; no credentials exchanged.
    LinuxShellUnauthenticated,
    /// Shell prompt observed after (or without) a credential exchange.
    LinuxShellAuthenticated,
    /// Secondary bootloader prompt captured (see the bootloader bridge).
    BootloaderPrompt,
    /// Nothing observed yet, or the last exchange left the state unclear.
    Unknown,
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::PoweredOff => "powered-off",
            Self::Booting => "booting",
            Self::LinuxShellUnauthenticated => "shell-unauthenticated",
            Self::LinuxShellAuthenticated => "shell-authenticated",
            Self::BootloaderPrompt => "bootloader-prompt",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Sequences the target from power-on through an authenticated shell.
pub struct BootAutomaton<'a> {
    session: &'a mut SerialSession,
    timing: &'a ConsolePolicy,
    state: BootState,
}

impl<'a> BootAutomaton<'a> {
    /// Wrap a session; the target state is unknown until observed.
    pub fn new(session: &'a mut SerialSession, timing: &'a ConsolePolicy) -> Self {
        Self {
            session,
            timing,
            state: BootState::Unknown,
        }
    }

    /// Current automaton state.
    #[must_use]
    pub fn state(&self) -> BootState {
        self.state
    }

    /// Apply power through the collaborator and enter the boot wait.
    pub fn power_on(&mut self, power: &mut dyn PowerControl) -> Result<()> {
        power.power_on()?;
        self.session.reset()?;
        self.state = BootState::Booting;
        Ok(())
    }

    /// Cycle power and restart the boot observation from scratch.
    pub fn power_cycle(&mut self, power: &mut dyn PowerControl) -> Result<()> {
        power.cycle()?;
        self.session.reset()?;
        self.state = BootState::Booting;
        Ok(())
    }

    /// Wait for the target to present either a login prompt or, for a board
    /// still logged in from a prior cycle, a shell prompt. Whichever marker
    /// appears earliest in the stream decides the transition. An idle getty
    /// is nudged with a blank line, but only once the configured nudge delay
    /// has passed. Exceeding the boot ceiling is fatal
    /// [`ProvisionError::BootTimeout`].
    pub fn wait_for_shell(&mut self) -> Result<BootState> {
        let start = Instant::now();
        let deadline = start + self.timing.boot_timeout();
        let mut next_nudge = start + self.timing.nudge_delay();
        loop {
            self.session.poll()?;
            let buffer = self.session.buffer();
            let login_at = buffer.find(LOGIN_PROMPT);
            let shell_at = match (buffer.find(ROOT_PROMPT), buffer.find(USER_PROMPT)) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match (login_at, shell_at) {
                (Some(login), Some(shell)) if shell < login => {
                    info!("shell prompt before any login prompt; already authenticated");
                    self.state = BootState::LinuxShellAuthenticated;
                    return Ok(self.state);
                }
                (Some(_), _) => {
                    debug!("login prompt observed");
                    self.state = BootState::LinuxShellUnauthenticated;
                    return Ok(self.state);
                }
                (None, Some(_)) => {
                    info!("shell prompt observed without login prompt");
                    self.state = BootState::LinuxShellAuthenticated;
                    return Ok(self.state);
                }
                (None, None) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ProvisionError::BootTimeout);
            }
            if now >= next_nudge {
                // A bare newline makes an idle getty reprint its prompt, but
                // the same newline is "any key" to an open autoboot
                // countdown, so nothing is sent before the nudge delay.
                self.session.send_line("")?;
                next_nudge = now + self.timing.nudge_interval();
            }
            std::thread::sleep(self.session.poll_interval().min(deadline - now));
        }
    }

    /// One deterministic credential exchange: login name, password-prompt
    /// wait, password, settle, blank-line probe. The probe echo must no
    /// longer contain a login or password prompt.
    pub fn login(&mut self, credentials: &Credentials) -> Result<()> {
        if self.state != BootState::LinuxShellUnauthenticated {
            return Err(ProvisionError::Config(format!(
                "login attempted in state {}",
                self.state
            )));
        }
        self.session.reset()?;
        self.session.send_line(&credentials.user)?;
        let matched = self
            .session
            .wait_for(&PASSWORD_PROMPTS, self.timing.login_timeout())?;
        if matched.is_none() {
            return Err(ProvisionError::LoginTimeout);
        }
        self.session.reset()?;
        self.session.send_line(&credentials.password)?;
        self.session.pump(self.timing.login_settle())?;

        self.session.reset()?;
        self.session.send_line("")?;
        self.session.pump(self.timing.probe_window())?;
        let echo = self.session.buffer();
        let still_prompting = echo.contains(LOGIN_PROMPT)
            || PASSWORD_PROMPTS.iter().any(|prompt| echo.contains(prompt));
        if still_prompting {
            self.state = BootState::Unknown;
            return Err(ProvisionError::AuthenticationFailed);
        }
        info!("login accepted for {}", credentials.user);
        self.state = BootState::LinuxShellAuthenticated;
        Ok(())
    }

    /// Run one shell command on the authenticated console and return the
    /// accumulated echo once the shell prompt returns.
    pub fn shell_command(&mut self, command: &str) -> Result<String> {
        self.shell_command_bounded(command, self.timing.command_timeout())
    }

    /// Like [`Self::shell_command`] with an explicit ceiling, for commands
    /// such as the OS install that legitimately run for minutes.
    pub fn shell_command_bounded(&mut self, command: &str, timeout: Duration) -> Result<String> {
        if self.state != BootState::LinuxShellAuthenticated {
            return Err(ProvisionError::Config(format!(
                "console command attempted in state {}",
                self.state
            )));
        }
        self.session.reset()?;
        self.session.send_line(command)?;
        let matched = self
            .session
            .wait_for(&[ROOT_PROMPT, USER_PROMPT], timeout)?;
        if matched.is_none() {
            return Err(ProvisionError::HostCommand(format!(
                "console command {command:?} produced no prompt"
            )));
        }
        Ok(self.session.buffer().to_owned())
    }

    /// Read the board's hardware serial number off the running system.
    pub fn read_board_serial(&mut self) -> Result<String> {
        let echo = self.shell_command("cat /proc/cpuinfo | grep Serial")?;
        for line in echo.lines() {
            if line.contains("grep") {
                continue; // echoed command line
            }
            if let Some((label, value)) = line.split_once(':') {
                let value = value.trim();
                if label.contains("Serial")
                    && value.len() >= 8
                    && value.chars().all(|c| c.is_ascii_hexdigit())
                {
                    return Ok(value.to_ascii_lowercase());
                }
            }
        }
        Err(ProvisionError::HostCommand(
            "board serial number not found in console output".into(),
        ))
    }
}
