pub mod artifacts;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod machine;
pub mod observability;
pub mod router;
pub mod simulate;
pub mod site;
pub mod task;

pub use site::{Site, StepReport};
