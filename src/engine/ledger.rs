//! Deletion bookkeeping that outlives a single batch cycle.
//!
//! Cleanup is detached, so the next cycle can fetch a message whose delete is
//! still in flight, or one the source keeps showing after a failed delete.
//! The ledger keeps such messages out of issuance and decides whether their
//! id is handed to cleanup again.

use crate::source::RawMessage;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteState {
    /// Handed to a cleanup task that has not finished yet.
    InFlight,
    /// Delete confirmed; kept until a fetch stops returning the id.
    Deleted,
    /// Delete refused; the next fetch that still sees it schedules another,
    /// a fetch that no longer sees it forgets it.
    Failed,
}

/// A fetch split by the ledger.
#[derive(Debug, Default)]
pub(crate) struct Admitted {
    /// Messages seen for the first time; these go through issuance.
    pub fresh: Vec<RawMessage>,
    /// Ids to hand to cleanup this cycle: every fresh id plus earlier failures.
    pub to_delete: Vec<String>,
    /// Messages held back from issuance because they were consumed before.
    pub already_consumed: usize,
}

#[derive(Debug, Default)]
pub(crate) struct DeletionLedger {
    entries: Mutex<HashMap<String, DeleteState>>,
}

impl DeletionLedger {
    /// Sort a fetch into fresh messages and deletions, marking every id in
    /// `to_delete` as in flight. Finished deletes the source no longer
    /// returns are forgotten.
    pub fn admit(&self, messages: Vec<RawMessage>) -> Admitted {
        let mut entries = self.entries.lock();

        let visible: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        entries.retain(|id, state| *state == DeleteState::InFlight || visible.contains(id.as_str()));

        let mut admitted = Admitted::default();
        for message in messages {
            match entries.get(&message.id).copied() {
                None => {
                    entries.insert(message.id.clone(), DeleteState::InFlight);
                    admitted.to_delete.push(message.id.clone());
                    admitted.fresh.push(message);
                }
                Some(DeleteState::Failed) => {
                    entries.insert(message.id.clone(), DeleteState::InFlight);
                    admitted.to_delete.push(message.id);
                    admitted.already_consumed += 1;
                }
                Some(DeleteState::InFlight | DeleteState::Deleted) => {
                    admitted.already_consumed += 1;
                }
            }
        }
        admitted
    }

    /// Record the outcome of one delete.
    pub fn finish(&self, id: &str, deleted: bool) {
        let state = if deleted {
            DeleteState::Deleted
        } else {
            DeleteState::Failed
        };
        self.entries.lock().insert(id.to_string(), state);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
