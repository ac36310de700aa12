use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use colored::*;
use evidence_keystore::DEFAULT_KEY_NAME;
use evidence_package::{Manifest, PackBuilder, PackageSigner, ARCHIVE_EXTENSION};
use tracing::warn;

use super::{keystore, load_signer};
use crate::config::CliConfig;
use crate::PackArgs;

pub fn run(config: &CliConfig, args: PackArgs) -> Result<PathBuf> {
    let output = match args.out {
        Some(ref out) => out.clone(),
        None => auto_name(&config.recordings_dir, &args.dir, Local::now()),
    };

    let mut template = Manifest::builder(args.cli_command.as_str());
    if let Some(goal) = args.goal {
        template = template.goal(goal);
    }
    if let Some(notes) = args.notes {
        template = template.notes(notes);
    }
    for (name, value) in args.metrics {
        template = template.metric(name, value);
    }
    if let Some(who) = args.approved_by {
        template = template.approved_by(who);
    }
    for tag in args.tags {
        template = template.tag(tag);
    }

    let mut builder = PackBuilder::new(&args.dir, template.build());
    if let Some(viewer) = args.viewer {
        builder = builder.viewer_asset(viewer);
    }
    if !args.no_sign {
        if let Some(signer) = signer_or_warn(config) {
            builder = builder.sign_with(signer);
        }
    }

    let manifest = builder
        .write(&output)
        .with_context(|| format!("packing {} into {}", args.dir.display(), output.display()))?;

    println!("{} packed {}", "✓".bright_green(), output.display().to_string().bold());
    println!("  workflow: {}", manifest.workflow_id);
    println!("  entries:  {}", manifest.digests.len());
    match manifest.signature {
        Some(ref block) => println!("  signed:   {}", block.signer.bright_green()),
        None => println!("  signed:   {}", "no".yellow()),
    }
    Ok(output)
}

/// Signing problems leave the archive unsigned rather than aborting the pack
fn signer_or_warn(config: &CliConfig) -> Option<PackageSigner> {
    if config.signer == DEFAULT_KEY_NAME {
        match keystore(config).generate_if_missing(DEFAULT_KEY_NAME) {
            Ok(true) => println!(
                "{} generated default signing key in {}",
                "→".bright_white(),
                config.keys_dir.display()
            ),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "could not create default signing key"),
        }
    }

    match load_signer(config, &config.signer) {
        Ok(signer) => Some(signer),
        Err(e) => {
            eprintln!(
                "{} {:#}; archive will be unsigned",
                "warning:".yellow().bold(),
                e
            );
            None
        }
    }
}

/// `<recordings_dir>/<source dir name>_<YYYYMMDD_HHMMSS>.epi`
fn auto_name(recordings_dir: &Path, source_dir: &Path, now: DateTime<Local>) -> PathBuf {
    let stem = source_dir
        .file_name()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .unwrap_or("recording");
    recordings_dir.join(format!(
        "{stem}_{}.{ARCHIVE_EXTENSION}",
        now.format("%Y%m%d_%H%M%S")
    ))
}
