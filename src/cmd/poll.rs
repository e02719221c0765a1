//! One-shot detection pass: `fedrun poll`.
//!
//! Without `--execute` the pass only reads the status cache, so a worker
//! sharing the same file cache still dispatches every change it lists.

use anyhow::Result;
use fedrun::Site;
use serde_json::json;

use super::super::Cli;

pub async fn cmd_poll(cli: &Cli, execute: bool, monitor: bool) -> Result<()> {
    let config = super::load_config(cli)?;
    config.ensure_directories()?;
    let site = Site::from_config(config)?;

    let entries: Vec<serde_json::Value> = if execute {
        let reports = if monitor {
            site.monitor_tick().await?
        } else {
            site.tick().await?
        };
        reports
            .into_iter()
            .map(|report| {
                let status = report.run.status.name();
                json!({
                    "run": report.run,
                    "status": status,
                    "outcome": format!("{:?}", report.outcome),
                })
            })
            .collect()
    } else {
        let detector = site.detector();
        let dispatches = if monitor {
            detector.detect_stalled().await?
        } else {
            detector.preview_changes().await?
        };
        dispatches
            .into_iter()
            .map(|dispatch| {
                let status = dispatch.run.status.name();
                json!({
                    "run": dispatch.run,
                    "status": status,
                    "trigger": dispatch.trigger.name(),
                })
            })
            .collect()
    };

    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}
