// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Error taxonomy shared by every provisioning component.
// Author: Lukas Bower

//! Provisioning error taxonomy.
//!
//! Every component reports through [`ProvisionError`]. Variants that reflect
//! possibly-mutated irreversible state ([`ProvisionError::FuseWriteFailed`],
//! [`ProvisionError::MergeShapeViolation`]) are fatal and must never be
//! retried; the orchestration layer consults [`ProvisionError::is_fatal`]
//! before applying any bounded retry policy.

use thiserror::Error;

use crate::fuse::FuseStep;

/// Convenience alias used across the crate.
pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

/// Failures surfaced by the provisioning components.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Underlying stream or filesystem I/O failed.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The serial device could not be opened or driven.
    #[error("serial port failure: {0}")]
    Serial(#[from] serialport::Error),

    /// No login or shell prompt appeared within the boot ceiling.
    #[error("target produced no shell within the boot window")]
    BootTimeout,

    /// The password prompt never followed the login name.
    #[error("target produced no password prompt within the login window")]
    LoginTimeout,

    /// The bootloader prompt was not captured before autoboot won the race.
    #[error("bootloader prompt not seen after {attempts} interrupt attempts")]
    BootInterruptMissed {
        /// Interrupt keystrokes sent before giving up.
        attempts: u32,
    },

    /// The bootloader never asked for programming confirmation.
    #[error("no confirmation prompt for fuse step {step}")]
    FuseConfirmationTimeout {
        /// Sub-step that was awaiting confirmation.
        step: FuseStep,
    },

    /// The target kept prompting for credentials after the exchange.
    #[error("credentials rejected by the target")]
    AuthenticationFailed,

    /// Another station claimed the candidate row first.
    #[error("ledger claim lost to a concurrent station")]
    AllocationConflict,

    /// Every ledger row is already assigned.
    #[error("no unassigned rows remain in the ledger")]
    AllocationExhausted,

    /// A confirmed fuse write produced no completion marker. Fuse state is
    /// now unknown and must not be touched again.
    #[error("fuse step {step} did not complete; fuse state is undefined")]
    FuseWriteFailed {
        /// Sub-step whose completion marker never appeared.
        step: FuseStep,
    },

    /// The merged claim touched more than its own ledger row.
    #[error("merged claim altered more than one ledger row: {detail}")]
    MergeShapeViolation {
        /// Diff summary that failed the shape check.
        detail: String,
    },

    /// The shared inventory file could not be understood.
    #[error("malformed ledger: {0}")]
    Ledger(String),

    /// A collaborator command exited unsuccessfully.
    #[error("host command failed: {0}")]
    HostCommand(String),

    /// The station policy failed validation.
    #[error("invalid station policy: {0}")]
    Config(String),
}

impl ProvisionError {
    /// Errors that may reflect already-mutated irreversible state. These are
    /// never retried, not even by a full power cycle.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FuseWriteFailed { .. } | Self::MergeShapeViolation { .. }
        )
    }

    /// Errors the orchestrator may answer with another power cycle.
    #[must_use]
    pub fn retryable_by_power_cycle(&self) -> bool {
        matches!(
            self,
            Self::BootTimeout | Self::AuthenticationFailed | Self::BootInterruptMissed { .. }
        )
    }
}
