use std::path::Path;

use anyhow::{Context, Result};
use colored::*;
use evidence_package::{verify_archive, SignatureStatus, VerificationReport, VerifyPolicy};

use super::keystore;
use crate::config::CliConfig;

/// Print the report; returns whether the archive is acceptable under the policy
pub fn run(
    config: &CliConfig,
    file: &Path,
    allow_unsigned: bool,
    allow_unknown_signer: bool,
) -> Result<bool> {
    let policy = VerifyPolicy {
        allow_unsigned: allow_unsigned || config.allow_unsigned,
        allow_unknown_signer,
    };
    let report = verify_archive(file, &keystore(config))
        .with_context(|| format!("verifying {}", file.display()))?;

    print_report(&report);

    let acceptable = report.is_acceptable(&policy);
    println!();
    if report.is_trusted() {
        println!("    {}", "Verification PASSED".bright_green().bold());
    } else if acceptable {
        println!(
            "    {}",
            "Verification PASSED (integrity only, signature not verified)".yellow().bold()
        );
    } else {
        println!("    {}", "Verification FAILED".bright_red().bold());
    }
    Ok(acceptable)
}

fn print_report(report: &VerificationReport) {
    println!("archive:   {}", report.path.display());
    println!("workflow:  {}", report.manifest.workflow_id);
    println!("command:   {}", report.manifest.cli_command);
    println!("created:   {}", report.manifest.created_at.to_rfc3339());

    let integrity = report.integrity_summary();
    if report.integrity.ok() {
        println!("integrity: {}", integrity.bright_green());
    } else {
        println!("integrity: {}", integrity.bright_red());
    }

    let signature = report.signature.to_string();
    let signature = match report.signature {
        SignatureStatus::Verified { .. } => signature.bright_green(),
        SignatureStatus::Rejected { .. } => signature.bright_red(),
        SignatureStatus::Unsigned | SignatureStatus::KeyUnavailable { .. } => signature.yellow(),
    };
    println!("signature: {signature}");
}
