// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the forgebench provisioning station.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for the forgebench provisioning station.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};

use forgebench::allocate::Allocator;
use forgebench::gitledger::GitClaimStore;
use forgebench::policy::{PolicyOverrides, StationPolicy};
use forgebench::run::ProvisionRun;

/// Forgebench station command-line arguments.
#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "Gateway board provisioning station", long_about = None)]
struct Cli {
    /// Path to the station policy TOML.
    #[arg(long, value_name = "FILE", default_value = "station.toml")]
    config: PathBuf,

    /// Override the serial console device.
    #[arg(long)]
    device: Option<String>,

    /// Override the serial baud rate.
    #[arg(long)]
    baud: Option<u32>,

    /// Override the boot ceiling in seconds.
    #[arg(long)]
    boot_timeout_secs: Option<u64>,

    /// Override the ledger claim attempt cap.
    #[arg(long)]
    max_claim_attempts: Option<u32>,

    /// Override the ledger remote URL.
    #[arg(long)]
    ledger_remote: Option<String>,

    /// Override the station identity.
    #[arg(long)]
    station_id: Option<String>,

    /// Allocate a MAC for the given board serial and exit, without touching
    /// any hardware.
    #[arg(long, requires = "board_serial")]
    allocate_only: bool,

    /// Board serial for --allocate-only.
    #[arg(long)]
    board_serial: Option<String>,

    /// Print the effective policy and exit.
    #[arg(long, conflicts_with_all = ["allocate_only", "board_serial"])]
    show_policy: bool,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let overrides = PolicyOverrides {
        console_device: cli.device.clone(),
        console_baud: cli.baud,
        boot_timeout_secs: cli.boot_timeout_secs,
        max_claim_attempts: cli.max_claim_attempts,
        ledger_remote: cli.ledger_remote.clone(),
        station_id: cli.station_id.clone(),
    };
    let policy = StationPolicy::load(&cli.config)
        .with_context(|| format!("loading station policy {}", cli.config.display()))?
        .with_overrides(&overrides)?;

    if cli.show_policy {
        println!("{policy:#?}");
        return Ok(());
    }

    if cli.allocate_only {
        let serial = cli
            .board_serial
            .as_deref()
            .context("--allocate-only needs --board-serial")?;
        let mut store = GitClaimStore::new(&policy.ledger, &policy.station)?;
        let outcome =
            Allocator::new(&mut store, policy.ledger.max_claim_attempts).allocate(serial)?;
        println!("{}", outcome.mac);
        return Ok(());
    }

    install_interrupt_guard(&policy)?;

    let summary = ProvisionRun::new(policy).execute()?;
    info!(
        "board {} provisioned as {}{}",
        summary.serial,
        summary.mac,
        if summary.newly_assigned {
            ""
        } else {
            " (already assigned)"
        }
    );
    Ok(())
}

/// On Ctrl-C, power the board off before exiting; a half-provisioned board
/// must not be left running.
fn install_interrupt_guard(policy: &StationPolicy) -> Result<()> {
    let off_command = policy.power.off_command.clone();
    ctrlc::set_handler(move || {
        warn!("interrupted; powering the target off");
        let result = Command::new("sh").args(["-c", &off_command]).status();
        if !matches!(result, Ok(status) if status.success()) {
            error!("power-off on interrupt failed");
        }
        std::process::exit(130);
    })
    .context("installing the interrupt handler")
}
