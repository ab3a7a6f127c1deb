// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: MAC allocation coordinator over a conflict-checked claim store.
// Author: Lukas Bower

//! Allocation coordinator.
//!
//! One attempt is: hard resync, idempotency check, scan for the first
//! unassigned row, publish a claim. Losing the claim race restarts the whole
//! attempt from the resync with a fresh scan, up to a configured cap. The MAC
//! is only handed onwards after the store has verified the merged change.

use log::info;

use crate::error::{ProvisionError, Result};
use crate::ledger::{AllocationClaim, ClaimStore};
use crate::mac::MacAddr;

/// Result of one allocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOutcome {
    /// Address bound to the board.
    pub mac: MacAddr,
    /// False when the board already held a row and nothing was written.
    pub newly_assigned: bool,
}

/// Runs the bounded claim loop against any [`ClaimStore`].
pub struct Allocator<'a> {
    store: &'a mut dyn ClaimStore,
    max_attempts: u32,
}

impl<'a> Allocator<'a> {
    /// Wrap a store with a claim attempt cap.
    pub fn new(store: &'a mut dyn ClaimStore, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    /// Allocate a MAC for the given board serial.
    ///
    /// Re-running for an already-assigned serial returns the existing MAC
    /// without touching the ledger. An exhausted ledger is
    /// [`ProvisionError::AllocationExhausted`]; losing the race on every
    /// attempt is [`ProvisionError::AllocationConflict`].
    pub fn allocate(&mut self, serial: &str) -> Result<AllocationOutcome> {
        for attempt in 1..=self.max_attempts {
            let ledger = self.store.synchronize()?;

            if let Some(existing) = ledger.record_for_serial(serial) {
                info!("board {serial} already holds {}", existing.mac);
                return Ok(AllocationOutcome {
                    mac: existing.mac,
                    newly_assigned: false,
                });
            }

            let candidate = ledger
                .first_unassigned()
                .ok_or(ProvisionError::AllocationExhausted)?
                .mac;

            let claim = AllocationClaim::new(candidate, serial);
            match self.store.submit(&claim) {
                Ok(()) => {
                    info!("board {serial} assigned {candidate} on attempt {attempt}");
                    return Ok(AllocationOutcome {
                        mac: candidate,
                        newly_assigned: true,
                    });
                }
                Err(ProvisionError::AllocationConflict) => {
                    info!("claim attempt {attempt} lost the race; resyncing");
                }
                Err(other) => return Err(other),
            }
        }
        Err(ProvisionError::AllocationConflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;

    /// In-memory store that loses the race a set number of times.
    struct FlakyStore {
        ledger: Ledger,
        conflicts_left: u32,
        submissions: u32,
    }

    impl FlakyStore {
        fn new(text: &str, conflicts: u32) -> Self {
            Self {
                ledger: Ledger::parse(text).unwrap(),
                conflicts_left: conflicts,
                submissions: 0,
            }
        }
    }

    impl ClaimStore for FlakyStore {
        fn synchronize(&mut self) -> Result<Ledger> {
            Ok(self.ledger.clone())
        }

        fn submit(&mut self, claim: &AllocationClaim) -> Result<()> {
            self.submissions += 1;
            if self.conflicts_left > 0 {
                self.conflicts_left -= 1;
                return Err(ProvisionError::AllocationConflict);
            }
            self.ledger.assign(&claim.mac, &claim.serial)
        }
    }

    const TWO_FREE: &str = "\
02:42:ac:00:00:01,0
02:42:ac:00:00:02,0
";

    #[test]
    fn assigns_first_free_row() {
        let mut store = FlakyStore::new(TWO_FREE, 0);
        let outcome = Allocator::new(&mut store, 3).allocate("babe000011112222").unwrap();
        assert!(outcome.newly_assigned);
        assert_eq!(outcome.mac.to_string(), "02:42:ac:00:00:01");
    }

    #[test]
    fn retries_after_conflict_then_succeeds() {
        let mut store = FlakyStore::new(TWO_FREE, 2);
        let outcome = Allocator::new(&mut store, 3).allocate("babe000011112222").unwrap();
        assert!(outcome.newly_assigned);
        assert_eq!(store.submissions, 3);
    }

    #[test]
    fn gives_up_after_attempt_cap() {
        let mut store = FlakyStore::new(TWO_FREE, 10);
        let err = Allocator::new(&mut store, 3)
            .allocate("babe000011112222")
            .unwrap_err();
        assert!(matches!(err, ProvisionError::AllocationConflict));
        assert_eq!(store.submissions, 3);
    }

    #[test]
    fn idempotent_for_known_serial() {
        let mut store = FlakyStore::new(
            "02:42:ac:00:00:01,babe000011112222\n02:42:ac:00:00:02,0\n",
            0,
        );
        let before = store.ledger.content_hash();
        let outcome = Allocator::new(&mut store, 3).allocate("babe000011112222").unwrap();
        assert!(!outcome.newly_assigned);
        assert_eq!(outcome.mac.to_string(), "02:42:ac:00:00:01");
        assert_eq!(store.submissions, 0);
        assert_eq!(store.ledger.content_hash(), before);
    }

    #[test]
    fn exhausted_ledger_is_terminal() {
        let mut store = FlakyStore::new("02:42:ac:00:00:01,babe000011112222\n", 0);
        let err = Allocator::new(&mut store, 3).allocate("cafe000011112222").unwrap_err();
        assert!(matches!(err, ProvisionError::AllocationExhausted));
    }
}
