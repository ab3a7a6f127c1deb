// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Station-side collaborators: power, status panel, host commands.
// Author: Lukas Bower

//! Station collaborators.
//!
//! Power control, the operator status panel and host-side commands sit behind
//! narrow traits so orchestration and tests never depend on station wiring.
//! The shell-command implementations are deliberately thin: build the command
//! line from policy, run it, map a non-zero exit to
//! [`ProvisionError::HostCommand`].

use std::process::Command;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::policy::{FlashPolicy, NetworkPolicy, PanelPolicy, PowerPolicy};

/// Board power collaborator. The original station drives a relay through a
/// GPIO line; any on/off mechanism fits behind this trait.
pub trait PowerControl {
    /// Apply power.
    fn power_on(&mut self) -> Result<()>;
    /// Remove power.
    fn power_off(&mut self) -> Result<()>;
    /// Remove then reapply power, with the configured settle pause between.
    fn cycle(&mut self) -> Result<()>;
}

/// Two-line operator display. The original station has a 16x2 character LCD.
pub trait StatusPanel {
    /// Show two lines of status text.
    fn show(&mut self, top: &str, bottom: &str);
}

fn run_shell(line: &str) -> Result<()> {
    debug!("host command: {line}");
    let output = Command::new("sh").args(["-c", line]).output()?;
    if !output.status.success() {
        return Err(ProvisionError::HostCommand(format!(
            "{line}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Power control that shells out to the configured on/off command lines.
pub struct ShellPower {
    on_command: String,
    off_command: String,
    settle: Duration,
}

impl ShellPower {
    /// Build from the power section of the station policy.
    #[must_use]
    pub fn new(policy: &PowerPolicy) -> Self {
        Self {
            on_command: policy.on_command.clone(),
            off_command: policy.off_command.clone(),
            settle: policy.settle(),
        }
    }
}

impl PowerControl for ShellPower {
    fn power_on(&mut self) -> Result<()> {
        info!("powering the target on");
        run_shell(&self.on_command)
    }

    fn power_off(&mut self) -> Result<()> {
        info!("powering the target off");
        run_shell(&self.off_command)
    }

    fn cycle(&mut self) -> Result<()> {
        self.power_off()?;
        std::thread::sleep(self.settle);
        self.power_on()
    }
}

/// Panel that pipes both lines to the configured display command. Display
/// problems never fail a run; they are logged and swallowed.
pub struct ShellPanel {
    command: String,
}

impl ShellPanel {
    /// Build from the panel section of the station policy.
    #[must_use]
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_owned(),
        }
    }
}

impl StatusPanel for ShellPanel {
    fn show(&mut self, top: &str, bottom: &str) {
        let line = format!("{} {:?} {:?}", self.command, top, bottom);
        if let Err(err) = run_shell(&line) {
            warn!("status panel update failed: {err}");
        }
    }
}

/// Fallback panel that writes status lines to the log.
#[derive(Default)]
pub struct LogPanel;

impl StatusPanel for LogPanel {
    fn show(&mut self, top: &str, bottom: &str) {
        info!("panel: {top} | {bottom}");
    }
}

/// Choose the panel implementation the policy asks for.
#[must_use]
pub fn panel_from_policy(policy: &PanelPolicy) -> Box<dyn StatusPanel> {
    match &policy.command {
        Some(command) => Box::new(ShellPanel::new(command)),
        None => Box::new(LogPanel),
    }
}

/// Host-side plumbing around the provisioning network link and artifacts.
pub struct HostOps<'a> {
    network: &'a NetworkPolicy,
    flash: &'a FlashPolicy,
}

impl<'a> HostOps<'a> {
    /// Wrap the relevant policy sections.
    #[must_use]
    pub fn new(network: &'a NetworkPolicy, flash: &'a FlashPolicy) -> Self {
        Self { network, flash }
    }

    /// Put the provisioning address on the host interface. An address that is
    /// already present is fine.
    pub fn configure_interface(&self) -> Result<()> {
        let line = format!(
            "ip addr replace {}/{} dev {}",
            self.network.host_address, self.network.prefix_len, self.network.interface
        );
        run_shell(&line)
    }

    /// Remove the provisioning address again. Best effort on teardown.
    pub fn release_interface(&self) {
        let line = format!(
            "ip addr del {}/{} dev {}",
            self.network.host_address, self.network.prefix_len, self.network.interface
        );
        if let Err(err) = run_shell(&line) {
            debug!("interface teardown skipped: {err}");
        }
    }

    /// Copy the OS image and its blockmap to the target over the
    /// provisioning link.
    pub fn transfer_image(&self) -> Result<()> {
        for artifact in [&self.flash.image, &self.flash.bmap] {
            let line = format!(
                "scp -i {} -o StrictHostKeyChecking=no {} root@{}:{}",
                self.network.ssh_key, artifact, self.network.target_address, self.flash.remote_dir
            );
            info!("copying {artifact} to the target");
            run_shell(&line)?;
        }
        Ok(())
    }

    /// Print a rendered label file to the label printer device node.
    pub fn print_label(&self, label_file: &str, printer_device: &str) -> Result<()> {
        run_shell(&format!("cat {label_file} > {printer_device}"))
    }
}
