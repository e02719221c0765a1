//! Configuration view and validation commands: `fedrun config`.

use anyhow::Result;
use fedrun::config::{CONFIG_FILE_NAME, Config, FedrunToml};
use std::path::PathBuf;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => std::env::current_dir()?.join(CONFIG_FILE_NAME),
    };
    let overrides = super::overrides(cli);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Fedrun Configuration");
            println!("====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Using defaults plus environment and CLI overrides.");
            }
            println!();

            let explicit = cli.config.as_deref();
            let config = Config::resolve(explicit, &overrides)?;
            print_effective(&config);

            if let Err(err) = config.validate() {
                println!();
                println!("Warning: {}", err);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            match Config::load(cli.config.as_deref(), &overrides) {
                Ok(config) => {
                    println!("Configuration is valid.");
                    println!("  site_uid = \"{}\"", config.site_uid);
                    println!("  router.url = \"{}\"", config.router.url);
                    println!();
                }
                Err(err) => {
                    println!("Configuration is invalid:");
                    println!("  - {:#}", err);
                    println!();
                    return Err(err);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("{} already exists at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Pass --force to overwrite it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }

            FedrunToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE_NAME, config_path.display());
            println!();
            println!("You can now set:");
            println!("  - [router] url, username, password");
            println!("  - [site] uid, artifact_root, state_dir");
            println!("  - [dispatch] poll and monitor intervals, partitions");
            println!();
        }
    }

    Ok(())
}

fn print_effective(config: &Config) {
    let display = |path: &PathBuf| path.display().to_string();

    println!("[router]");
    println!("  url = \"{}\"", config.router.url);
    println!("  username = \"{}\"", config.router.username);
    println!(
        "  password = {}",
        if config.router.password.is_empty() { "(unset)" } else { "(set)" }
    );
    println!("  timeout_secs = {}", config.router.timeout.as_secs());
    println!();
    println!("[site]");
    println!("  uid = \"{}\"", config.site_uid);
    println!("  artifact_root = \"{}\"", display(&config.artifact_root));
    println!("  state_dir = \"{}\"", display(&config.state_dir));
    println!();
    println!("[dispatch]");
    println!("  poll_interval_secs = {}", config.poll_interval.as_secs());
    println!("  monitor_interval_secs = {}", config.monitor_interval.as_secs());
    println!("  partitions = {}", config.partitions);
    println!("  step_timeout_secs = {}", config.step_timeout.as_secs());
    println!("  queue_depth = {}", config.queue_depth);
    println!();
    println!("[cache]");
    println!("  backend = \"{}\"", config.cache_backend);
    println!("  ttl_secs = {}", config.cache_ttl.as_secs());
    println!("  reset_on_start = {}", config.reset_cache_on_start);
    println!();
    println!("[logging]");
    println!("  format = \"{}\"", format!("{:?}", config.log_format).to_lowercase());
    if let Some(file) = &config.log_file {
        println!("  file = \"{}\"", display(file));
    }
}
