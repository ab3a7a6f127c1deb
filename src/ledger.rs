// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Shared MAC inventory model and the conflict-checked claim seam.
// Author: Lukas Bower

//! MAC inventory ledger.
//!
//! The ledger is a two-column file, one row per MAC: lowercase colon-hex
//! address, then the assigned board serial or the sentinel `0`. Rows are
//! append-only in meaning: a MAC is assigned at most once and never
//! unassigned or reassigned. Allocation decisions are only ever made against
//! a freshly synchronized copy, never a cached snapshot.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::error::{ProvisionError, Result};
use crate::mac::MacAddr;

/// Second-column literal marking a row as unassigned.
pub const UNASSIGNED_SENTINEL: &str = "0";

/// Prefix for claim branch names.
pub const CLAIM_BRANCH_PREFIX: &str = "mac-assign-";

/// Assignment state of one ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// Row is free for allocation.
    Unassigned,
    /// Row is permanently bound to this board serial.
    Serial(String),
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacRecord {
    /// The address this row governs; unique within the ledger.
    pub mac: MacAddr,
    /// Current assignment state.
    pub assigned: Assignment,
}

/// Ordered, durable table of MAC assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    records: Vec<MacRecord>,
}

impl Ledger {
    /// Parse the two-column file format. Duplicate MACs and malformed rows
    /// are rejected outright; a corrupt inventory must never feed an
    /// allocation decision.
    pub fn parse(text: &str) -> Result<Self> {
        let mut records = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (mac_text, serial_text) = line.split_once(',').ok_or_else(|| {
                ProvisionError::Ledger(format!("row {}: expected two columns", number + 1))
            })?;
            let mac: MacAddr = mac_text.trim().parse().map_err(|err| {
                ProvisionError::Ledger(format!("row {}: {err}", number + 1))
            })?;
            if records.iter().any(|record: &MacRecord| record.mac == mac) {
                return Err(ProvisionError::Ledger(format!(
                    "row {}: duplicate MAC {mac}",
                    number + 1
                )));
            }
            let serial_text = serial_text.trim();
            let assigned = if serial_text == UNASSIGNED_SENTINEL {
                Assignment::Unassigned
            } else if serial_text.is_empty() {
                return Err(ProvisionError::Ledger(format!(
                    "row {}: empty assignment column",
                    number + 1
                )));
            } else {
                Assignment::Serial(serial_text.to_owned())
            };
            records.push(MacRecord { mac, assigned });
        }
        Ok(Self { records })
    }

    /// Render back to the file format, one row per MAC.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&record.mac.to_string());
            out.push(',');
            match &record.assigned {
                Assignment::Unassigned => out.push_str(UNASSIGNED_SENTINEL),
                Assignment::Serial(serial) => out.push_str(serial),
            }
            out.push('\n');
        }
        out
    }

    /// Row already bound to this board serial, if any.
    #[must_use]
    pub fn record_for_serial(&self, serial: &str) -> Option<&MacRecord> {
        self.records
            .iter()
            .find(|record| matches!(&record.assigned, Assignment::Serial(s) if s == serial))
    }

    /// First unassigned row in ledger order. First match wins: the scan is
    /// deterministic and auditable, never randomized.
    #[must_use]
    pub fn first_unassigned(&self) -> Option<&MacRecord> {
        self.records
            .iter()
            .find(|record| record.assigned == Assignment::Unassigned)
    }

    /// Bind one unassigned row to a serial. Assigning a missing or
    /// already-bound row is a ledger violation.
    pub fn assign(&mut self, mac: &MacAddr, serial: &str) -> Result<()> {
        let record = self
            .records
            .iter_mut()
            .find(|record| record.mac == *mac)
            .ok_or_else(|| ProvisionError::Ledger(format!("MAC {mac} not in ledger")))?;
        if record.assigned != Assignment::Unassigned {
            return Err(ProvisionError::Ledger(format!(
                "MAC {mac} is already assigned"
            )));
        }
        record.assigned = Assignment::Serial(serial.to_owned());
        Ok(())
    }

    /// Content hash of the rendered ledger, for idempotency verification.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.render().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the ledger holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate rows in ledger order.
    pub fn records(&self) -> impl Iterator<Item = &MacRecord> {
        self.records.iter()
    }
}

/// A proposed single-row mutation from unassigned to assigned-to-serial,
/// published under a uniquely named branch and merged only after the diff
/// shape check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationClaim {
    /// Address being claimed.
    pub mac: MacAddr,
    /// Board serial receiving the address.
    pub serial: String,
    /// Claim branch, `mac-assign-<8 hex chars>`.
    pub branch: String,
}

impl AllocationClaim {
    /// Build a claim with a fresh branch name.
    #[must_use]
    pub fn new(mac: MacAddr, serial: &str) -> Self {
        Self {
            branch: claim_branch(&mac, serial),
            mac,
            serial: serial.to_owned(),
        }
    }
}

/// Derive a unique claim branch name from the claim content and the clock.
#[must_use]
pub fn claim_branch(mac: &MacAddr, serial: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(mac.to_string().as_bytes());
    hasher.update(serial.as_bytes());
    hasher.update(nanos.to_le_bytes());
    let digest = hasher.finalize();
    format!("{CLAIM_BRANCH_PREFIX}{}", hex::encode(&digest[..4]))
}

/// Conflict-checked transactional update over the shared ledger.
///
/// The contract mirrors an optimistic compare-and-swap: `synchronize`
/// discards local state and fetches the authoritative head; `submit`
/// publishes exactly one row mutation and merges it, reporting
/// [`ProvisionError::AllocationConflict`] when another station moved the
/// head first and [`ProvisionError::MergeShapeViolation`] when the merged
/// change does not have the one-row shape. Any store with those semantics
/// (a git remote, a row-versioned table) can back the allocation algorithm.
pub trait ClaimStore {
    /// Drop any local copy and fetch the authoritative ledger head.
    fn synchronize(&mut self) -> Result<Ledger>;

    /// Publish and merge one claim against the head last synchronized.
    fn submit(&mut self, claim: &AllocationClaim) -> Result<()>;
}
