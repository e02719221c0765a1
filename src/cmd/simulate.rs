//! In-process lifecycle simulation: `fedrun simulate`.

use anyhow::{Context, Result};
use fedrun::observability::init_logging;
use fedrun::simulate::{SimulationOptions, run_simulation};
use fedrun::task::TaskRegistry;

use super::super::Cli;

pub async fn cmd_simulate(
    cli: &Cli,
    participants: usize,
    rounds: u64,
    model: &str,
    max_ticks: usize,
    json: bool,
) -> Result<()> {
    init_logging(cli.log_format.unwrap_or_default(), None);

    // Without an explicit state dir, keep everything in a throwaway directory.
    let scratch;
    let state_dir = match &cli.state_dir {
        Some(dir) => dir.clone(),
        None => {
            scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
            scratch.path().to_path_buf()
        }
    };

    let options = SimulationOptions {
        participants,
        rounds: rounds.max(1),
        model: model.to_string(),
        max_ticks,
        state_dir,
    };
    let report = run_simulation(&options, TaskRegistry::with_builtins()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!(
            "Simulation ({} tick(s), {} transition(s), {} upload(s))",
            report.ticks, report.transitions, report.uploads
        );
        println!("==========");
        for site in &report.sites {
            let round = site
                .current_round
                .map(|r| format!(" round {}", r))
                .unwrap_or_default();
            println!(
                "  {:<16} run {:<4} {:<12} {}{}",
                site.site_uid,
                site.run_id,
                site.role.to_string(),
                site.status,
                round
            );
        }
        println!();
    }

    if !report.all_succeeded() {
        anyhow::bail!("Simulation ended with unfinished or failed runs");
    }
    Ok(())
}
