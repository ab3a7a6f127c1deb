// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Git-backed ledger tests against a local bare remote.
// Author: Lukas Bower

use std::path::Path;
use std::process::Command;

use anyhow::{ensure, Context, Result};
use tempfile::TempDir;

use forgebench::gitledger::GitClaimStore;
use forgebench::ledger::{AllocationClaim, ClaimStore};
use forgebench::policy::{LedgerPolicy, StationIdentity};
use forgebench::{Allocator, MacAddr, ProvisionError};

const SEED: &str = "\
02:42:ac:00:00:01,0
02:42:ac:00:00:02,0
02:42:ac:00:00:03,1a2b3c4d5e6f7788
";

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["-c", "user.name=fixture", "-c", "user.email=fixture@test"])
        .args(args)
        .output()
        .context("spawning git")?;
    ensure!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Bare remote seeded with the sample ledger on `main`.
struct Fixture {
    root: TempDir,
    remote: String,
}

impl Fixture {
    fn new() -> Result<Self> {
        let root = TempDir::new()?;
        let remote_dir = root.path().join("inventory.git");
        std::fs::create_dir(&remote_dir)?;
        git(&remote_dir, &["init", "--bare", "--initial-branch=main", "."])?;

        let seed_dir = root.path().join("seed");
        std::fs::create_dir(&seed_dir)?;
        git(&seed_dir, &["init", "--initial-branch=main", "."])?;
        std::fs::write(seed_dir.join("db.csv"), SEED)?;
        git(&seed_dir, &["add", "db.csv"])?;
        git(&seed_dir, &["commit", "-m", "seed inventory"])?;
        let remote = remote_dir.to_string_lossy().into_owned();
        git(&seed_dir, &["push", &remote, "main"])?;

        Ok(Self { root, remote })
    }

    fn policy(&self) -> LedgerPolicy {
        LedgerPolicy {
            remote: self.remote.clone(),
            main_branch: "main".into(),
            file: "db.csv".into(),
            workdir_root: self.root.path().join("work").to_string_lossy().into_owned(),
            max_claim_attempts: 5,
        }
    }

    fn station(&self, id: &str) -> StationIdentity {
        StationIdentity {
            id: id.into(),
            record_path: self.root.path().join("records.log").to_string_lossy().into_owned(),
        }
    }

    fn remote_ledger(&self) -> Result<String> {
        git(Path::new(&self.remote), &["show", "main:db.csv"])
    }
}

#[test]
fn claim_lands_on_the_remote_main_line() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut store = GitClaimStore::new(&fixture.policy(), &fixture.station("station-a"))?;

    let outcome = Allocator::new(&mut store, 5).allocate("babe000011112222")?;
    assert!(outcome.newly_assigned);
    assert_eq!(outcome.mac.to_string(), "02:42:ac:00:00:01");

    let remote = fixture.remote_ledger()?;
    assert!(remote.contains("02:42:ac:00:00:01,babe000011112222"));
    assert!(remote.contains("02:42:ac:00:00:02,0"));
    Ok(())
}

#[test]
fn reallocation_for_a_known_serial_writes_nothing() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut store = GitClaimStore::new(&fixture.policy(), &fixture.station("station-a"))?;

    Allocator::new(&mut store, 5).allocate("babe000011112222")?;
    let before = fixture.remote_ledger()?;

    let outcome = Allocator::new(&mut store, 5).allocate("babe000011112222")?;
    assert!(!outcome.newly_assigned);
    assert_eq!(outcome.mac.to_string(), "02:42:ac:00:00:01");
    assert_eq!(fixture.remote_ledger()?, before);
    Ok(())
}

#[test]
fn stale_claim_is_rejected_as_a_conflict() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut first = GitClaimStore::new(&fixture.policy(), &fixture.station("station-a"))?;
    let mut second = GitClaimStore::new(&fixture.policy(), &fixture.station("station-b"))?;

    // Both stations observe the same head and race for the same row.
    let ledger_a = first.synchronize()?;
    let ledger_b = second.synchronize()?;
    let row = ledger_a.first_unassigned().unwrap().mac;
    assert_eq!(row, ledger_b.first_unassigned().unwrap().mac);

    first.submit(&AllocationClaim::new(row, "aaaa000011112222"))?;
    let err = second
        .submit(&AllocationClaim::new(row, "bbbb000011112222"))
        .unwrap_err();
    assert!(matches!(err, ProvisionError::AllocationConflict));

    // The loser resyncs and lands on the next free row.
    let outcome = Allocator::new(&mut second, 5).allocate("bbbb000011112222")?;
    assert!(outcome.newly_assigned);
    assert_eq!(outcome.mac.to_string(), "02:42:ac:00:00:02");

    let remote = fixture.remote_ledger()?;
    assert!(remote.contains("02:42:ac:00:00:01,aaaa000011112222"));
    assert!(remote.contains("02:42:ac:00:00:02,bbbb000011112222"));
    Ok(())
}

#[test]
fn multi_row_claim_is_a_merge_shape_violation() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut store = GitClaimStore::new(&fixture.policy(), &fixture.station("station-a"))?;
    let ledger = store.synchronize()?;
    let row = ledger.first_unassigned().unwrap().mac;

    // A corrupted working copy smuggles a second row change into the claim
    // commit; the post-merge diff check must stop the run.
    let tampered = SEED.replace("02:42:ac:00:00:02,0", "02:42:ac:00:00:02,feed000011112222");
    std::fs::write(store.workdir().join("db.csv"), tampered)?;

    let err = store
        .submit(&AllocationClaim::new(row, "aaaa000011112222"))
        .unwrap_err();
    assert!(matches!(err, ProvisionError::MergeShapeViolation { .. }));
    assert!(err.is_fatal());
    Ok(())
}

#[test]
fn exhausted_remote_reports_no_rows_left() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut store = GitClaimStore::new(&fixture.policy(), &fixture.station("station-a"))?;

    Allocator::new(&mut store, 5).allocate("aaaa000011112222")?;
    Allocator::new(&mut store, 5).allocate("bbbb000011112222")?;
    let err = Allocator::new(&mut store, 5)
        .allocate("cccc000011112222")
        .unwrap_err();
    assert!(matches!(err, ProvisionError::AllocationExhausted));
    Ok(())
}

#[test]
fn workdirs_are_unique_per_store() -> Result<()> {
    let fixture = Fixture::new()?;
    let first = GitClaimStore::new(&fixture.policy(), &fixture.station("station-a"))?;
    let second = GitClaimStore::new(&fixture.policy(), &fixture.station("station-a"))?;
    assert_ne!(first.workdir(), second.workdir());
    Ok(())
}

#[test]
fn claim_branches_are_cleaned_up_after_the_merge() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut store = GitClaimStore::new(&fixture.policy(), &fixture.station("station-a"))?;
    Allocator::new(&mut store, 5).allocate("babe000011112222")?;

    let branches = git(Path::new(&fixture.remote), &["branch", "--list"])?;
    let named: Vec<&str> = branches
        .lines()
        .map(|line| line.trim_start_matches(['*', ' ']))
        .filter(|line| !line.is_empty())
        .collect();
    assert_eq!(named, ["main"], "claim branches must not accumulate");
    Ok(())
}

#[test]
fn mac_row_round_trips_through_the_remote() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut store = GitClaimStore::new(&fixture.policy(), &fixture.station("station-a"))?;
    let outcome = Allocator::new(&mut store, 5).allocate("babe000011112222")?;

    let remote = fixture.remote_ledger()?;
    let row = remote
        .lines()
        .find(|line| line.ends_with("babe000011112222"))
        .unwrap();
    let mac: MacAddr = row.split(',').next().unwrap().parse()?;
    assert_eq!(mac, outcome.mac);
    Ok(())
}
