use std::path::Path;

use anyhow::{Context, Result};
use colored::*;
use evidence_package::resign;

use super::load_signer;
use crate::config::CliConfig;

pub fn run(config: &CliConfig, file: &Path, name: Option<&str>) -> Result<()> {
    let name = name.unwrap_or(config.signer.as_str());
    let signer = load_signer(config, name)?;
    let manifest = resign(file, &signer).with_context(|| format!("signing {}", file.display()))?;

    println!(
        "{} signed {} as '{}'",
        "✓".bright_green(),
        file.display().to_string().bold(),
        name
    );
    if let Some(block) = manifest.signature {
        println!("  signed_at: {}", block.signed_at.to_rfc3339());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use evidence_keystore::Keystore;
    use evidence_package::{pack, read_manifest, Manifest, ENVIRONMENT_ENTRY, STEPS_ENTRY};
    use std::fs;

    #[test]
    fn signs_in_place_with_named_key() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CliConfig {
            keys_dir: dir.path().join("keys"),
            recordings_dir: dir.path().join("rec"),
            signer: "default".to_string(),
            allow_unsigned: false,
        };
        Keystore::new(&cfg.keys_dir).generate("ops", false).unwrap();

        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join(STEPS_ENTRY), b"").unwrap();
        fs::write(src.join(ENVIRONMENT_ENTRY), b"{}").unwrap();
        let archive = dir.path().join("a.epi");
        pack(&src, Manifest::new("make test"), &archive).unwrap();

        assert!(run(&cfg, &archive, None).is_err());
        run(&cfg, &archive, Some("ops")).unwrap();
        assert_eq!(read_manifest(&archive).unwrap().signature.unwrap().signer, "ops");
    }
}
