//! Detection and execution queues.
//!
//! Detection (which runs need attention) and execution (one state-machine
//! step) are decoupled:
//!
//! - the [`Detector`] turns router polls into [`Dispatch`] items, either from
//!   a status change (`Poll`) or from a coordinator stuck waiting on its batch
//!   (`Monitor`). Detection passes are serialized per site;
//! - the [`WorkerPool`] executes dispatches on partitions keyed by run id, so
//!   steps for one run never overlap and run in enqueue order.

mod detector;
mod pool;
mod service;

pub use detector::Detector;
pub use pool::{WorkerPool, execute, partition_for};
pub use service::run_worker;

use fedrun_common::Run;

/// What caused a run to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Poll,
    Monitor,
}

impl Trigger {
    pub fn name(self) -> &'static str {
        match self {
            Trigger::Poll => "poll",
            Trigger::Monitor => "monitor",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One run snapshot queued for a single step.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub run: Run,
    pub trigger: Trigger,
}

impl Dispatch {
    pub fn new(run: Run, trigger: Trigger) -> Self {
        Self { run, trigger }
    }
}
