// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Git-backed conflict-checked transactional ledger updates.
// Author: Lukas Bower

//! Git claim store.
//!
//! The shared ledger lives at the head of a git remote. `synchronize` is a
//! hard reset to the remote head; `submit` publishes one claim commit on a
//! uniquely named branch and then fast-forwards the main line to it. The
//! remote rejects the fast-forward push whenever another station moved the
//! head first, which is exactly the compare-and-swap this store needs. After
//! the merge lands, the diff against the pre-claim base must change exactly
//! one ledger row or the run stops with a shape violation.

use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::ledger::{AllocationClaim, ClaimStore, Ledger};
use crate::policy::{LedgerPolicy, StationIdentity};

/// Claim store backed by a git remote.
pub struct GitClaimStore {
    remote: String,
    main_branch: String,
    ledger_file: String,
    workdir: PathBuf,
    author_name: String,
    author_email: String,
    /// Remote head observed by the last `synchronize`; claims diff against it.
    base: Option<String>,
}

impl GitClaimStore {
    /// Build a store with a fresh per-run working directory under the
    /// configured root. Working copies are never reused across runs.
    pub fn new(policy: &LedgerPolicy, station: &StationIdentity) -> Result<Self> {
        let workdir = policy.fresh_workdir(&station.id)?;
        Ok(Self {
            remote: policy.remote.clone(),
            main_branch: policy.main_branch.clone(),
            ledger_file: policy.file.clone(),
            workdir,
            author_name: format!("station {}", station.id),
            author_email: format!("{}@forgebench.local", station.id),
            base: None,
        })
    }

    /// Working directory holding the local clone.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.workdir)
            .args(["-c", &format!("user.name={}", self.author_name)])
            .args(["-c", &format!("user.email={}", self.author_email)])
            .args(args)
            .output()?;
        if !output.status.success() {
            return Err(ProvisionError::HostCommand(format!(
                "git {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Like [`Self::git`] but reports success as a bool, for commands whose
    /// failure is an expected protocol outcome rather than an error.
    fn git_allowed_to_fail(&self, args: &[&str]) -> Result<(bool, String)> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.workdir)
            .args(["-c", &format!("user.name={}", self.author_name)])
            .args(["-c", &format!("user.email={}", self.author_email)])
            .args(args)
            .output()?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Ok((output.status.success(), stderr))
    }

    fn clone_if_needed(&self) -> Result<()> {
        if self.workdir.join(".git").is_dir() {
            return Ok(());
        }
        let output = Command::new("git")
            .args(["clone", "--branch", &self.main_branch, &self.remote])
            .arg(&self.workdir)
            .output()?;
        if !output.status.success() {
            return Err(ProvisionError::HostCommand(format!(
                "git clone {}: {}",
                self.remote,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn remote_main(&self) -> String {
        format!("origin/{}", self.main_branch)
    }

    /// The merged claim must change exactly one row of the ledger file:
    /// one line added, one removed, no other file touched.
    fn verify_merge_shape(&self, merged: &str) -> Result<()> {
        let base = self.base.as_deref().ok_or_else(|| {
            ProvisionError::Ledger("claim submitted without a synchronized base".into())
        })?;
        let numstat = self.git(&["diff", "--numstat", &format!("{base}..{merged}")])?;
        let expected = format!("1\t1\t{}", self.ledger_file);
        let lines: Vec<&str> = numstat.lines().collect();
        if lines.len() != 1 || lines[0].trim_end() != expected {
            return Err(ProvisionError::MergeShapeViolation {
                detail: if numstat.trim().is_empty() {
                    "empty diff".into()
                } else {
                    numstat.trim().replace('\t', " ")
                },
            });
        }
        Ok(())
    }

    fn read_ledger(&self) -> Result<Ledger> {
        let text = std::fs::read_to_string(self.workdir.join(&self.ledger_file))?;
        Ledger::parse(&text)
    }
}

impl ClaimStore for GitClaimStore {
    /// Hard resync: fetch the remote, discard every local change, record the
    /// observed head as the claim base, then parse the ledger file.
    fn synchronize(&mut self) -> Result<Ledger> {
        self.clone_if_needed()?;
        self.git(&["fetch", "origin", &self.main_branch])?;
        self.git(&["checkout", "-B", &self.main_branch, &self.remote_main()])?;
        self.git(&["reset", "--hard", &self.remote_main()])?;
        let head = self.git(&["rev-parse", "HEAD"])?.trim().to_owned();
        debug!("ledger synchronized at {head}");
        self.base = Some(head);
        self.read_ledger()
    }

    /// Publish the claim branch, then compare-and-swap the main line onto it.
    /// A rejected fast-forward push means another station won; the caller
    /// resynchronizes and rescans.
    fn submit(&mut self, claim: &AllocationClaim) -> Result<()> {
        self.git(&["checkout", "-b", &claim.branch])?;

        let mut ledger = self.read_ledger()?;
        ledger.assign(&claim.mac, &claim.serial)?;
        std::fs::write(self.workdir.join(&self.ledger_file), ledger.render())?;

        self.git(&["add", &self.ledger_file])?;
        self.git(&[
            "commit",
            "-m",
            &format!("Assign {} to board {}", claim.mac, claim.serial),
        ])?;
        let merged = self.git(&["rev-parse", "HEAD"])?.trim().to_owned();
        self.git(&["push", "origin", &claim.branch])?;

        // The fast-forward push is the compare-and-swap: it lands only if the
        // remote head is still the base this claim was built on.
        let refspec = format!("{}:{}", claim.branch, self.main_branch);
        let (merged_ok, stderr) = self.git_allowed_to_fail(&["push", "origin", &refspec])?;
        if !merged_ok {
            info!("claim {} rejected by the remote: {}", claim.branch, stderr.trim());
            let _ = self.git_allowed_to_fail(&["push", "origin", "--delete", &claim.branch]);
            self.git(&["checkout", &self.main_branch])?;
            let (_, _) = self.git_allowed_to_fail(&["branch", "-D", &claim.branch])?;
            return Err(ProvisionError::AllocationConflict);
        }

        // Confirm the remote main line actually contains our commit before
        // trusting the merge.
        self.git(&["fetch", "origin", &self.main_branch])?;
        let (is_ancestor, _) = self.git_allowed_to_fail(&[
            "merge-base",
            "--is-ancestor",
            &merged,
            &self.remote_main(),
        ])?;
        if !is_ancestor {
            warn!("claim {} pushed but absent from the main line", claim.branch);
            return Err(ProvisionError::AllocationConflict);
        }
        self.verify_merge_shape(&merged)?;

        if let (false, stderr) =
            self.git_allowed_to_fail(&["push", "origin", "--delete", &claim.branch])?
        {
            debug!("claim branch cleanup skipped: {}", stderr.trim());
        }
        self.git(&["checkout", &self.main_branch])?;
        let (_, _) = self.git_allowed_to_fail(&["branch", "-D", &claim.branch])?;
        info!("claim {} merged as {merged}", claim.branch);
        Ok(())
    }
}
