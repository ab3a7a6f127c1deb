// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Full factory sequence with named steps and bounded retries.
// Author: Lukas Bower

//! Provisioning run orchestration.
//!
//! The run drives every step of one board in order and stops at the first
//! failure, naming the failed step. Bounded retries live here and only here:
//! a lost boot or login is answered with a power cycle up to
//! `console.boot_attempts`, a lost bootloader interrupt race with another
//! cycle up to `bootloader.power_cycle_attempts`. Fatal errors are never
//! retried. There is no mid-sequence resume; a failed board is re-run from
//! the top, which the allocation idempotency check makes safe.

use std::fmt;
use std::io::Write;

use chrono::Utc;
use log::{error, info, warn};
use thiserror::Error;

use crate::allocate::{AllocationOutcome, Allocator};
use crate::boot::{BootAutomaton, BootState};
use crate::error::{ProvisionError, Result};
use crate::fuse::FuseProgrammer;
use crate::gitledger::GitClaimStore;
use crate::policy::StationPolicy;
use crate::serial::SerialSession;
use crate::station::{panel_from_policy, HostOps, PowerControl, ShellPower, StatusPanel};
use crate::uboot::BootloaderBridge;

/// Named steps of the factory sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Put the provisioning address on the host interface.
    HostNetwork,
    /// Apply board power.
    PowerOn,
    /// Wait for a login or shell marker.
    BootWait,
    /// Exchange credentials.
    Login,
    /// Read the board hardware serial over the console.
    SerialProbe,
    /// Copy the OS image and blockmap to the target.
    Transfer,
    /// Write the image to the target disk.
    InstallOs,
    /// Claim a MAC from the shared ledger.
    Allocate,
    /// Win the bootloader interrupt race.
    EnterBootloader,
    /// Burn the MAC fuses and persist the environment.
    BurnFuses,
    /// Append the non-authoritative side record.
    Record,
    /// Print the board label.
    Label,
    /// Remove board power.
    PowerOff,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::HostNetwork => "host-network",
            Self::PowerOn => "power-on",
            Self::BootWait => "boot-wait",
            Self::Login => "login",
            Self::SerialProbe => "serial-probe",
            Self::Transfer => "transfer",
            Self::InstallOs => "install-os",
            Self::Allocate => "allocate",
            Self::EnterBootloader => "enter-bootloader",
            Self::BurnFuses => "burn-fuses",
            Self::Record => "record",
            Self::Label => "label",
            Self::PowerOff => "power-off",
        };
        f.write_str(label)
    }
}

/// A run failure tagged with the step it happened in.
#[derive(Debug, Error)]
#[error("step {step} failed: {source}")]
pub struct RunError {
    /// Step that failed.
    pub step: Step,
    /// Underlying failure.
    #[source]
    pub source: ProvisionError,
}

fn at(step: Step) -> impl FnOnce(ProvisionError) -> RunError {
    move |source| RunError { step, source }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Board hardware serial read over the console.
    pub serial: String,
    /// Address now bound to the board.
    pub mac: String,
    /// False when the board already held its row from an earlier run.
    pub newly_assigned: bool,
}

/// One complete provisioning run for one board.
pub struct ProvisionRun {
    policy: StationPolicy,
}

impl ProvisionRun {
    /// Build a run from a validated policy.
    #[must_use]
    pub fn new(policy: StationPolicy) -> Self {
        Self { policy }
    }

    /// Execute the full sequence. On failure the board is powered off before
    /// the error propagates.
    pub fn execute(&self) -> Result<RunSummary, RunError> {
        let mut power = ShellPower::new(&self.policy.power);
        let mut panel = panel_from_policy(&self.policy.panel);
        let host = HostOps::new(&self.policy.network, &self.policy.flash);
        let result = self.drive(&host, &mut power, panel.as_mut());
        match &result {
            Ok(summary) => {
                panel.show("DONE", &summary.mac);
            }
            Err(err) => {
                error!("{err}");
                panel.show("FAILED", &err.step.to_string());
                if err.step != Step::PowerOff {
                    if let Err(off_err) = power.power_off() {
                        warn!("power-off after failure also failed: {off_err}");
                    }
                }
            }
        }
        host.release_interface();
        result
    }

    fn drive(
        &self,
        host: &HostOps<'_>,
        power: &mut dyn PowerControl,
        panel: &mut dyn StatusPanel,
    ) -> Result<RunSummary, RunError> {
        let policy = &self.policy;

        panel.show("PROVISIONING", "host network");
        host.configure_interface().map_err(at(Step::HostNetwork))?;

        let mut session = SerialSession::open(
            &policy.console.device,
            policy.console.baud,
            policy.console.poll_interval(),
        )
        .map_err(at(Step::PowerOn))?;
        let mut automaton = BootAutomaton::new(&mut session, &policy.console);

        panel.show("PROVISIONING", "booting");
        automaton.power_on(power).map_err(at(Step::PowerOn))?;
        self.boot_and_login(&mut automaton, power)?;

        panel.show("PROVISIONING", "reading serial");
        let serial = automaton.read_board_serial().map_err(at(Step::SerialProbe))?;
        info!("board serial {serial}");

        panel.show(&serial, "network up");
        automaton
            .shell_command(&format!(
                "ip addr add {}/{} dev eth0",
                policy.network.target_address, policy.network.prefix_len
            ))
            .map_err(at(Step::Transfer))?;

        panel.show(&serial, "copying image");
        host.transfer_image().map_err(at(Step::Transfer))?;

        panel.show(&serial, "installing OS");
        let image_name = file_name(&policy.flash.image);
        automaton
            .shell_command_bounded(
                &format!(
                    "bmaptool copy {}/{} {}",
                    policy.flash.remote_dir, image_name, policy.flash.target_disk
                ),
                policy.flash.install_timeout(),
            )
            .map_err(at(Step::InstallOs))?;

        panel.show(&serial, "claiming MAC");
        let outcome = self.allocate(&serial).map_err(at(Step::Allocate))?;
        panel.show(&serial, &outcome.mac.to_string());

        panel.show(&serial, "bootloader");
        self.enter_bootloader(&mut session, power)?;

        panel.show(&serial, "burning fuses");
        FuseProgrammer::new(&mut session, &policy.bootloader)
            .burn(&outcome.mac)
            .map_err(at(Step::BurnFuses))?;

        self.append_record(&serial, &outcome).map_err(at(Step::Record))?;

        if outcome.newly_assigned {
            self.print_label(host, &serial, &outcome).map_err(at(Step::Label))?;
        }

        power.power_off().map_err(at(Step::PowerOff))?;

        Ok(RunSummary {
            serial,
            mac: outcome.mac.to_string(),
            newly_assigned: outcome.newly_assigned,
        })
    }

    /// Boot to a shell marker and authenticate, answering retryable failures
    /// with a power cycle up to the configured attempt cap.
    fn boot_and_login(
        &self,
        automaton: &mut BootAutomaton<'_>,
        power: &mut dyn PowerControl,
    ) -> Result<(), RunError> {
        let attempts = self.policy.console.boot_attempts;
        let mut attempt = 1;
        loop {
            let result = (|| -> Result<()> {
                let state = automaton.wait_for_shell()?;
                if state == BootState::LinuxShellUnauthenticated {
                    automaton.login(&self.policy.credentials)?;
                }
                Ok(())
            })();
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.retryable_by_power_cycle() && attempt < attempts => {
                    warn!("boot attempt {attempt} failed ({err}); power cycling");
                    attempt += 1;
                    automaton.power_cycle(power).map_err(at(Step::PowerOn))?;
                }
                Err(err @ ProvisionError::BootTimeout) => {
                    return Err(at(Step::BootWait)(err));
                }
                Err(err) => return Err(at(Step::Login)(err)),
            }
        }
    }

    fn allocate(&self, serial: &str) -> Result<AllocationOutcome> {
        let mut store = GitClaimStore::new(&self.policy.ledger, &self.policy.station)?;
        Allocator::new(&mut store, self.policy.ledger.max_claim_attempts).allocate(serial)
    }

    /// Bootloader entry with its own power-cycle retry budget. The final
    /// missed race propagates unchanged.
    fn enter_bootloader(
        &self,
        session: &mut SerialSession,
        power: &mut dyn PowerControl,
    ) -> Result<(), RunError> {
        let attempts = self.policy.bootloader.power_cycle_attempts;
        let mut attempt = 1;
        loop {
            let mut bridge = BootloaderBridge::new(session, &self.policy.bootloader);
            match bridge.enter(power) {
                Ok(()) => return Ok(()),
                Err(err @ ProvisionError::BootInterruptMissed { .. }) if attempt < attempts => {
                    warn!("bootloader entry attempt {attempt} missed ({err}); power cycling");
                    attempt += 1;
                }
                Err(err) => return Err(at(Step::EnterBootloader)(err)),
            }
        }
    }

    /// Append the side record. It is written after the ledger merge and is
    /// never consulted for allocation decisions.
    fn append_record(&self, serial: &str, outcome: &AllocationOutcome) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.policy.station.record_path)?;
        writeln!(
            file,
            "{} {} {} {}",
            Utc::now().to_rfc3339(),
            serial,
            outcome.mac,
            self.policy.station.id
        )?;
        Ok(())
    }

    fn print_label(
        &self,
        host: &HostOps<'_>,
        serial: &str,
        outcome: &AllocationOutcome,
    ) -> Result<()> {
        let Some(device) = &self.policy.label.device else {
            info!("no label printer configured; skipping label");
            return Ok(());
        };
        let label_file = std::env::temp_dir().join(format!("forgebench-label-{serial}.txt"));
        std::fs::write(&label_file, format!("SN {serial}\nMAC {}\n", outcome.mac))?;
        host.print_label(&label_file.to_string_lossy(), device)
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{BootloaderPolicy, NetworkPolicy, PowerPolicy};
    use crate::serial::ScriptedPort;
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

    #[test]
    fn exhausted_bootloader_retries_propagate_the_final_miss() {
        let run = ProvisionRun::new(StationPolicy {
            bootloader: BootloaderPolicy {
                interrupt_interval_ms: 1,
                interrupt_attempts: 3,
                power_cycle_attempts: 2,
                ..BootloaderPolicy::default()
            },
            ..StationPolicy::default()
        });
        let port = ScriptedPort::new().emit("Starting kernel ...\r\n");
        let mut session = SerialSession::new(Box::new(port), Duration::from_millis(1));

        let err = run
            .enter_bootloader(&mut session, &mut NullPower)
            .unwrap_err();
        assert_eq!(err.step, Step::EnterBootloader);
        assert!(matches!(
            err.source,
            ProvisionError::BootInterruptMissed { attempts: 3 }
        ));
    }

    #[test]
    fn host_network_failure_still_tears_down_cleanly() {
        // The interface cannot exist, so the run fails in its first step;
        // the teardown and power-off guards run on that path.
        let run = ProvisionRun::new(StationPolicy {
            network: NetworkPolicy {
                interface: "fbtest-missing0".into(),
                ..NetworkPolicy::default()
            },
            power: PowerPolicy {
                on_command: "true".into(),
                off_command: "true".into(),
                settle_ms: 0,
            },
            ..StationPolicy::default()
        });
        let err = run.execute().unwrap_err();
        assert_eq!(err.step, Step::HostNetwork);
    }

    #[test]
    fn step_labels_are_stable() {
        assert_eq!(Step::EnterBootloader.to_string(), "enter-bootloader");
        assert_eq!(Step::BurnFuses.to_string(), "burn-fuses");
    }

    #[test]
    fn run_error_names_the_step() {
        let err = RunError {
            step: Step::BootWait,
            source: ProvisionError::BootTimeout,
        };
        let text = err.to_string();
        assert!(text.contains("boot-wait"), "{text}");
    }

    #[test]
    fn file_name_strips_directories() {
        assert_eq!(file_name("/srv/images/gw.wic.gz"), "gw.wic.gz");
        assert_eq!(file_name("gw.wic.gz"), "gw.wic.gz");
    }
}
