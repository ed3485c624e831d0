//! Config command implementation.

use std::path::Path;

use anyhow::{Context, Result};

use ferry_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub fn run(args: ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    let path = config_path.map_or_else(Config::config_path, Path::to_path_buf);

    match args.action {
        ConfigAction::Show => {
            let mut shown = super::load_config(config_path)?;
            if shown.client.client_secret.is_some() {
                shown.client.client_secret = Some("<redacted>".to_string());
            }
            let toml = toml::to_string_pretty(&shown).context("Failed to render configuration")?;
            println!("# {}", path.display());
            println!("{}", toml);
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists. Pass --force to overwrite it.",
                    path.display()
                );
            }
            Config::default()
                .save_to(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("  Wrote default configuration to {}", path.display());
        }
        ConfigAction::Path => println!("{}", path.display()),
    }

    Ok(())
}
