//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `worker`        | `Worker`                                           |
//! | `poll`          | `Poll`                                             |
//! | `config`        | `Config`                                           |
//! | `cache`         | `Cache`                                            |
//! | `simulate`      | `Simulate`                                         |

pub mod cache;
pub mod config;
pub mod poll;
pub mod simulate;
pub mod worker;

pub use cache::cmd_cache;
pub use config::cmd_config;
pub use poll::cmd_poll;
pub use simulate::cmd_simulate;
pub use worker::cmd_worker;

use super::Cli;
use anyhow::Result;
use fedrun::config::{CliOverrides, Config};
use fedrun::observability::init_logging;

pub fn overrides(cli: &Cli) -> CliOverrides {
    CliOverrides {
        site_uid: cli.site_uid.clone(),
        router_url: cli.router_url.clone(),
        state_dir: cli.state_dir.clone(),
        log_format: cli.log_format,
    }
}

/// Load and validate configuration, then install logging from it.
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = Config::load(cli.config.as_deref(), &overrides(cli))?;
    init_logging(config.log_format, config.log_file.as_deref());
    Ok(config)
}
