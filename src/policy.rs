// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load and validate station provisioning policies.
// Author: Lukas Bower

//! Station policy.
//!
//! Every timing bound, device path, credential and collaborator command line
//! the run depends on is explicit and configurable here. The policy loads
//! from TOML, layers command-line overrides on top, and is validated before
//! any hardware is touched.

use std::path::PathBuf;
use std::process;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;

use crate::error::{ProvisionError, Result};

/// Identity of this provisioning station.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StationIdentity {
    /// Short station name, used in ledger commits and working directories.
    pub id: String,
    /// File receiving the non-authoritative per-board side records.
    pub record_path: String,
}

impl Default for StationIdentity {
    fn default() -> Self {
        Self {
            id: "station-0".into(),
            record_path: "provisioned.log".into(),
        }
    }
}

/// Console credentials for the target's default login.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Credentials {
    /// Login name.
    pub user: String,
    /// Password sent after the password prompt.
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            user: "root".into(),
            password: "root".into(),
        }
    }
}

/// Serial console device and Linux-side timing bounds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsolePolicy {
    /// Serial device node.
    pub device: String,
    /// Baud rate; the console is always 8N1 without flow control.
    pub baud: u32,
    /// Poll cadence for the rolling buffer in milliseconds.
    pub poll_interval_ms: u64,
    /// Ceiling for the power-on to shell-marker wait in seconds.
    pub boot_timeout_secs: u64,
    /// Quiet period after power-on before the first blank-line nudge, in
    /// seconds. Must outlast the autoboot countdown, which a stray newline
    /// would stop.
    pub nudge_delay_secs: u64,
    /// Cadence of blank-line nudges after the delay, in seconds.
    pub nudge_interval_secs: u64,
    /// Ceiling for the password prompt after the login name in seconds.
    pub login_timeout_secs: u64,
    /// Settle window after sending the password in milliseconds.
    pub login_settle_ms: u64,
    /// Window for the post-login blank-line probe in milliseconds.
    pub probe_window_ms: u64,
    /// Ceiling for one console shell command in seconds.
    pub command_timeout_secs: u64,
    /// Full boot-and-login attempts before the run fails.
    pub boot_attempts: u32,
}

impl Default for ConsolePolicy {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".into(),
            baud: 115_200,
            poll_interval_ms: 50,
            boot_timeout_secs: 120,
            nudge_delay_secs: 20,
            nudge_interval_secs: 5,
            login_timeout_secs: 15,
            login_settle_ms: 1_500,
            probe_window_ms: 1_500,
            command_timeout_secs: 30,
            boot_attempts: 3,
        }
    }
}

impl ConsolePolicy {
    /// Poll cadence.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Boot ceiling.
    #[must_use]
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    /// Quiet period before the first blank-line nudge.
    #[must_use]
    pub fn nudge_delay(&self) -> Duration {
        Duration::from_secs(self.nudge_delay_secs)
    }

    /// Blank-line nudge cadence.
    #[must_use]
    pub fn nudge_interval(&self) -> Duration {
        Duration::from_secs(self.nudge_interval_secs)
    }

    /// Password-prompt ceiling.
    #[must_use]
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    /// Post-password settle window.
    #[must_use]
    pub fn login_settle(&self) -> Duration {
        Duration::from_millis(self.login_settle_ms)
    }

    /// Blank-line probe window.
    #[must_use]
    pub fn probe_window(&self) -> Duration {
        Duration::from_millis(self.probe_window_ms)
    }

    /// Console command ceiling.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Bootloader entry and fuse programming timing bounds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootloaderPolicy {
    /// Gap between interrupt keystrokes in milliseconds.
    pub interrupt_interval_ms: u64,
    /// Interrupt keystrokes fired before declaring the race lost.
    pub interrupt_attempts: u32,
    /// Power cycles attempted when the interrupt race is lost.
    pub power_cycle_attempts: u32,
    /// Ceiling for the fuse confirmation prompt in seconds.
    pub confirm_timeout_secs: u64,
    /// Ceiling for one confirmed fuse write in seconds.
    pub write_timeout_secs: u64,
    /// Ceiling for environment set/save commands in seconds.
    pub env_timeout_secs: u64,
}

impl Default for BootloaderPolicy {
    fn default() -> Self {
        Self {
            interrupt_interval_ms: 100,
            interrupt_attempts: 100,
            power_cycle_attempts: 3,
            confirm_timeout_secs: 10,
            write_timeout_secs: 15,
            env_timeout_secs: 10,
        }
    }
}

impl BootloaderPolicy {
    /// Interrupt keystroke cadence.
    #[must_use]
    pub fn interrupt_interval(&self) -> Duration {
        Duration::from_millis(self.interrupt_interval_ms)
    }

    /// Fuse confirmation ceiling.
    #[must_use]
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    /// Fuse write ceiling.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Environment command ceiling.
    #[must_use]
    pub fn env_timeout(&self) -> Duration {
        Duration::from_secs(self.env_timeout_secs)
    }
}

/// OS image artifacts and the install command bounds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlashPolicy {
    /// Compressed OS image on the host.
    pub image: String,
    /// Blockmap file matching the image.
    pub bmap: String,
    /// Directory on the target receiving both artifacts.
    pub remote_dir: String,
    /// Disk device on the target that the image is written to.
    pub target_disk: String,
    /// Ceiling for the on-target install command in seconds.
    pub install_timeout_secs: u64,
}

impl Default for FlashPolicy {
    fn default() -> Self {
        Self {
            image: "gateway-image.wic.gz".into(),
            bmap: "gateway-image.wic.bmap".into(),
            remote_dir: "/tmp".into(),
            target_disk: "/dev/mmcblk2".into(),
            install_timeout_secs: 600,
        }
    }
}

impl FlashPolicy {
    /// Install command ceiling.
    #[must_use]
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

/// Provisioning network link between host and target.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkPolicy {
    /// Host interface facing the target.
    pub interface: String,
    /// Address placed on the host interface.
    pub host_address: String,
    /// Prefix length for the provisioning subnet.
    pub prefix_len: u8,
    /// Target address reachable once its initial OS is up.
    pub target_address: String,
    /// SSH identity file used for the artifact copy.
    pub ssh_key: String,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            interface: "eth1".into(),
            host_address: "192.168.7.1".into(),
            prefix_len: 24,
            target_address: "192.168.7.2".into(),
            ssh_key: "station_key".into(),
        }
    }
}

/// Shared MAC inventory location and claim bounds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerPolicy {
    /// Git remote URL holding the inventory.
    pub remote: String,
    /// Branch carrying the authoritative ledger head.
    pub main_branch: String,
    /// Ledger file name within the repository.
    pub file: String,
    /// Root under which per-run working copies are created.
    pub workdir_root: String,
    /// Claim attempts before the run gives up on the race.
    pub max_claim_attempts: u32,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            remote: String::new(),
            main_branch: "main".into(),
            file: "db.csv".into(),
            workdir_root: "/tmp/forgebench".into(),
            max_claim_attempts: 5,
        }
    }
}

impl LedgerPolicy {
    /// Create a unique per-run working directory under the configured root.
    /// Working copies are never reused across runs.
    pub fn fresh_workdir(&self, station_id: &str) -> Result<PathBuf> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let dir = PathBuf::from(&self.workdir_root).join(format!(
            "{station_id}-{}-{nanos}",
            process::id()
        ));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Board power collaborator command lines.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PowerPolicy {
    /// Command that applies power.
    pub on_command: String,
    /// Command that removes power.
    pub off_command: String,
    /// Pause between off and on during a cycle, in milliseconds.
    pub settle_ms: u64,
}

impl Default for PowerPolicy {
    fn default() -> Self {
        Self {
            on_command: "gpioset gpiochip0 17=1".into(),
            off_command: "gpioset gpiochip0 17=0".into(),
            settle_ms: 2_000,
        }
    }
}

impl PowerPolicy {
    /// Off-to-on settle pause.
    #[must_use]
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Operator status panel wiring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PanelPolicy {
    /// Display command receiving both status lines as arguments; when unset
    /// the status lines go to the log instead.
    pub command: Option<String>,
}

/// Label printer wiring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabelPolicy {
    /// Printer device node; when unset no label is printed.
    pub device: Option<String>,
}

/// Complete station policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StationPolicy {
    /// Station identity.
    pub station: StationIdentity,
    /// Serial console device and timing.
    pub console: ConsolePolicy,
    /// Target login credentials.
    pub credentials: Credentials,
    /// Bootloader entry and fuse timing.
    pub bootloader: BootloaderPolicy,
    /// OS image artifacts and install bounds.
    pub flash: FlashPolicy,
    /// Provisioning network link.
    pub network: NetworkPolicy,
    /// Shared MAC inventory.
    pub ledger: LedgerPolicy,
    /// Board power collaborator.
    pub power: PowerPolicy,
    /// Operator status panel.
    pub panel: PanelPolicy,
    /// Label printer.
    pub label: LabelPolicy,
}

/// Optional overrides layered on top of the loaded policy.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PolicyOverrides {
    /// Override the serial device node.
    pub console_device: Option<String>,
    /// Override the baud rate.
    pub console_baud: Option<u32>,
    /// Override the boot ceiling in seconds.
    pub boot_timeout_secs: Option<u64>,
    /// Override the claim attempt cap.
    pub max_claim_attempts: Option<u32>,
    /// Override the ledger remote URL.
    pub ledger_remote: Option<String>,
    /// Override the station id.
    pub station_id: Option<String>,
}

impl StationPolicy {
    /// Load a policy from a TOML file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let policy: Self = toml::from_str(&text).map_err(|err| {
            ProvisionError::Config(format!("{}: {err}", path.display()))
        })?;
        policy.validate()?;
        Ok(policy)
    }

    /// Apply overrides and revalidate.
    pub fn with_overrides(mut self, overrides: &PolicyOverrides) -> Result<Self> {
        if let Some(value) = &overrides.console_device {
            self.console.device = value.clone();
        }
        if let Some(value) = overrides.console_baud {
            self.console.baud = value;
        }
        if let Some(value) = overrides.boot_timeout_secs {
            self.console.boot_timeout_secs = value;
        }
        if let Some(value) = overrides.max_claim_attempts {
            self.ledger.max_claim_attempts = value;
        }
        if let Some(value) = &overrides.ledger_remote {
            self.ledger.remote = value.clone();
        }
        if let Some(value) = &overrides.station_id {
            self.station.id = value.clone();
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject configurations that cannot drive a run.
    pub fn validate(&self) -> Result<()> {
        if self.console.device.is_empty() {
            return Err(ProvisionError::Config("console.device is empty".into()));
        }
        if self.console.baud == 0 {
            return Err(ProvisionError::Config("console.baud must be non-zero".into()));
        }
        if self.console.poll_interval_ms == 0 {
            return Err(ProvisionError::Config(
                "console.poll_interval_ms must be non-zero".into(),
            ));
        }
        if self.console.boot_timeout_secs == 0 {
            return Err(ProvisionError::Config(
                "console.boot_timeout_secs must be non-zero".into(),
            ));
        }
        if self.console.boot_attempts == 0 {
            return Err(ProvisionError::Config(
                "console.boot_attempts must be at least 1".into(),
            ));
        }
        if self.bootloader.interrupt_attempts == 0 {
            return Err(ProvisionError::Config(
                "bootloader.interrupt_attempts must be at least 1".into(),
            ));
        }
        if self.bootloader.power_cycle_attempts == 0 {
            return Err(ProvisionError::Config(
                "bootloader.power_cycle_attempts must be at least 1".into(),
            ));
        }
        if self.ledger.remote.is_empty() {
            return Err(ProvisionError::Config("ledger.remote is empty".into()));
        }
        if self.ledger.file.is_empty() {
            return Err(ProvisionError::Config("ledger.file is empty".into()));
        }
        if self.ledger.max_claim_attempts == 0 {
            return Err(ProvisionError::Config(
                "ledger.max_claim_attempts must be at least 1".into(),
            ));
        }
        if self.station.id.is_empty() {
            return Err(ProvisionError::Config("station.id is empty".into()));
        }
        Ok(())
    }
}
