use fedrun_common::{Run, RunStatus};

/// What a coordinator may conclude from the current view of its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consensus {
    /// At least one site reported failure
    Failed,
    /// Every site, the coordinator included, is in the target status
    Ready,
    /// Not yet in sync
    Waiting,
}

/// Judge a batch view against `target`. Failure wins over readiness; an empty
/// view is never ready.
pub fn assess(siblings: &[Run], target: RunStatus) -> Consensus {
    if siblings.iter().any(|run| run.status.is_failure()) {
        return Consensus::Failed;
    }
    if !siblings.is_empty() && siblings.iter().all(|run| run.status == target) {
        return Consensus::Ready;
    }
    Consensus::Waiting
}

/// Ids of the sites not yet at `target`, for logging.
pub fn laggards(siblings: &[Run], target: RunStatus) -> Vec<String> {
    siblings
        .iter()
        .filter(|run| run.status != target)
        .map(|run| format!("{}:{}", run.site_uid, run.status))
        .collect()
}
