pub mod keys;
pub mod ls;
pub mod pack;
pub mod sign;
pub mod verify;

use anyhow::{Context, Result};
use evidence_keystore::Keystore;
use evidence_package::PackageSigner;

use crate::config::CliConfig;

fn keystore(config: &CliConfig) -> Keystore {
    Keystore::new(&config.keys_dir)
}

/// Load `name` from the configured keystore as a package signer
fn load_signer(config: &CliConfig, name: &str) -> Result<PackageSigner> {
    let key = keystore(config)
        .load_private(name)
        .with_context(|| format!("loading signing key '{name}' from {}", config.keys_dir.display()))?;
    Ok(PackageSigner::new(key, name))
}
