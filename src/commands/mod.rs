use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::state;
use anyhow::{Context, Result};

mod add;
mod clean;
mod info;
mod list;
mod remove;

pub fn execute(cli: Cli) -> Result<()> {
    let mut config =
        Config::load(cli.path.as_deref()).context("Failed to load configuration")?;
    apply_cli_overrides(&mut config, &cli);
    config.validate()?;

    // state mutation is single-writer; every command takes the lock
    let _lock = state::lock_state_dir(&config)
        .with_context(|| format!("Failed to lock state directory {:?}", config.state_dir))?;

    match cli.command {
        Commands::BundleAdd {
            bundles,
            skip_diskspace_check,
        } => {
            if skip_diskspace_check {
                config.skip_diskspace_check = true;
            }
            add::execute(&config, &bundles)?;
        }
        Commands::BundleRemove { bundles } => remove::execute(&config, &bundles)?,
        Commands::BundleList { all } => list::execute(&config, all)?,
        Commands::BundleInfo {
            bundle,
            dependencies,
            requires,
        } => info::execute(&config, &bundle, dependencies, requires)?,
        Commands::Clean { all, dry_run } => clean::execute(&config, all, dry_run)?,
    }
    Ok(())
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(state_dir) = &cli.state_dir {
        config.state_dir = state_dir.clone();
    }
    if let Some(url) = &cli.url {
        config.content_url = url.clone();
        config.version_url = url.clone();
    }
    if let Some(content_url) = &cli.content_url {
        config.content_url = content_url.clone();
    }
    if let Some(version_url) = &cli.version_url {
        config.version_url = version_url.clone();
    }
    if let Some(format) = cli.format {
        config.format = format;
    }
    if cli.nosigcheck {
        config.sigcheck = false;
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(retry_delay) = cli.retry_delay {
        config.retry_delay = retry_delay;
    }
}
