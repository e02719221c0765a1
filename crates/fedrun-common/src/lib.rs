//! Shared domain types for federated runs.
//!
//! These types mirror the router's run payloads: the run snapshot, its task
//! steps, the site role and the wire-stable lifecycle status codes. They carry
//! no I/O so that both the site worker and any router-side tooling can use them.

mod run;
mod status;

pub use run::{CURRENT_ROUND_KEY, Role, Run, TOTAL_ROUND_KEY, TaskStep};
pub use status::{RunStatus, StatusCodeError};
