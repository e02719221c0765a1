use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fedrun_common::{Run, RunStatus};

/// The coordinates of one step: the state being entered and where in the
/// task/round sequence it was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepKey {
    pub status: RunStatus,
    pub task_seq: usize,
    pub round: u64,
}

impl StepKey {
    pub fn of(run: &Run) -> Self {
        Self {
            status: run.status,
            task_seq: run.cur_seq,
            round: run.round_seq(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    key: StepKey,
    settled: bool,
}

/// This site's record of the last step entered for each run.
///
/// A settled step is never executed twice. An unsettled one (the coordinator
/// is still waiting, or the router did not confirm) is re-entered on the next
/// dispatch of the same snapshot.
#[derive(Debug, Default)]
pub struct StepLedger {
    entries: DashMap<String, LedgerEntry>,
}

impl StepLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `run_id`. Returns `false` when the same step already
    /// settled, in which case nothing must be executed.
    pub fn begin(&self, run_id: &str, key: StepKey) -> bool {
        match self.entries.entry(run_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.key == key && entry.settled {
                    return false;
                }
                *entry = LedgerEntry {
                    key,
                    settled: false,
                };
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LedgerEntry {
                    key,
                    settled: false,
                });
                true
            }
        }
    }

    /// Mark `key` settled, unless the run has since moved to another step.
    pub fn settle(&self, run_id: &str, key: StepKey) {
        if let Some(mut entry) = self.entries.get_mut(run_id) {
            if entry.key == key {
                entry.settled = true;
            }
        }
    }

    /// Drop everything known about a run. Used once it is finished.
    pub fn evict(&self, run_id: &str) -> bool {
        self.entries.remove(run_id).is_some()
    }

    /// The last step entered for a run and whether it settled.
    pub fn current(&self, run_id: &str) -> Option<(StepKey, bool)> {
        self.entries.get(run_id).map(|e| (e.key, e.settled))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
