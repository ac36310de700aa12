use anyhow::{Context, Result};
use colored::*;

use super::keystore;
use crate::config::CliConfig;
use crate::KeysAction;

pub fn run(config: &CliConfig, action: KeysAction) -> Result<()> {
    let ks = keystore(config);
    match action {
        KeysAction::Generate { name, overwrite } => {
            let name = name.unwrap_or_else(|| config.signer.clone());
            let key = ks
                .generate(&name, overwrite)
                .with_context(|| format!("generating key '{name}'"))?;
            println!("{} generated key '{}'", "✓".bright_green(), name.bold());
            println!("  dir:        {}", ks.dir().display());
            println!("  public key: {}", evidence_package::encode_public_key(&key));
        }
        KeysAction::List => {
            let keys = ks.list()?;
            if keys.is_empty() {
                println!("{}", format!("no keys in {}", ks.dir().display()).yellow());
                return Ok(());
            }
            for key in keys {
                let halves = match (key.has_private, key.has_public) {
                    (true, true) => "private+public",
                    (true, false) => "private",
                    _ => "public only",
                };
                let marker = if key.name == config.signer { "*" } else { " " };
                println!("{} {:<24} {}", marker.bright_cyan(), key.name, halves.dimmed());
            }
        }
        KeysAction::Export { name } => {
            let name = name.unwrap_or_else(|| config.signer.clone());
            let text = ks
                .export_public(&name)
                .with_context(|| format!("exporting key '{name}'"))?;
            println!("{text}");
        }
        KeysAction::Import {
            name,
            key,
            overwrite,
        } => {
            ks.import_public(&name, &key, overwrite)
                .with_context(|| format!("importing public key '{name}'"))?;
            println!("{} imported public key '{}'", "✓".bright_green(), name.bold());
        }
    }
    Ok(())
}
