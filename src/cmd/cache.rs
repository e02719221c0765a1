//! Status cache maintenance: `fedrun cache`.

use anyhow::Result;
use fedrun::cache::{ChangeDetector, store_from_config};

use super::super::{CacheCommands, Cli};

pub async fn cmd_cache(cli: &Cli, command: CacheCommands) -> Result<()> {
    let config = super::load_config(cli)?;

    match command {
        CacheCommands::Reset => {
            let cache = ChangeDetector::new(store_from_config(&config), config.cache_ttl);
            let cleared = cache.reset().await?;
            println!(
                "Cleared {} cached run snapshot(s) from the {} cache.",
                cleared,
                cache.backend_name()
            );
            if cache.backend_name() == "memory" {
                println!("The memory backend lives inside the worker process; it is reset on start.");
            }
        }
    }

    Ok(())
}
