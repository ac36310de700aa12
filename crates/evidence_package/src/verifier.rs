// Verification of evidence archives: per-entry integrity plus signer trust

use crate::container::read_entries_with_duplicates;
use crate::hash::digest;
use crate::manifest::Manifest;
use crate::signer::{get_signer_name, verify_embedded, verify_signature, SignatureVerdict};
use crate::{PackageError, PackageResult, MANIFEST_ENTRY};
use ed25519_dalek::VerifyingKey;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Why one entry failed its integrity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchKind {
    /// Listed in the manifest but absent from the archive
    Missing,
    DigestMismatch { expected: String, actual: String },
    /// Present in the archive but not listed in the manifest
    Untracked,
    /// Name occurs more than once in the archive
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub entry: String,
    pub kind: MismatchKind,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MismatchKind::Missing => write!(f, "{}: listed in manifest but missing", self.entry),
            MismatchKind::DigestMismatch { expected, actual } => write!(
                f,
                "{}: digest mismatch (expected {expected}, got {actual})",
                self.entry
            ),
            MismatchKind::Untracked => {
                write!(f, "{}: present in archive but not in manifest", self.entry)
            }
            MismatchKind::Duplicate => write!(f, "{}: appears more than once in archive", self.entry),
        }
    }
}

/// Exhaustive integrity result for one archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Entries whose digest matched
    pub verified: usize,
    pub mismatches: Vec<Mismatch>,
}

impl IntegrityReport {
    pub fn ok(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn mismatched_entries(&self) -> Vec<&str> {
        self.mismatches.iter().map(|m| m.entry.as_str()).collect()
    }

    pub fn into_result(self) -> PackageResult<()> {
        if self.ok() {
            Ok(())
        } else {
            Err(PackageError::IntegrityMismatch(
                self.mismatches.into_iter().map(|m| m.entry).collect(),
            ))
        }
    }
}

/// Recompute every entry digest and compare with the manifest
pub fn verify_integrity(path: &Path) -> PackageResult<IntegrityReport> {
    let (entries, duplicates) = read_entries_with_duplicates(path)?;
    let manifest = manifest_from_entries(path, &entries)?;
    let mut report = check_entries(&manifest, &entries);
    report_duplicates(&mut report, duplicates);
    Ok(report)
}

/// Repeated names are tampering even when the first copy matches its digest
fn report_duplicates(report: &mut IntegrityReport, duplicates: Vec<String>) {
    for entry in duplicates {
        let mismatch = Mismatch {
            entry,
            kind: MismatchKind::Duplicate,
        };
        if !report.mismatches.contains(&mismatch) {
            debug!(mismatch = %mismatch, "integrity check failed for entry");
            report.mismatches.push(mismatch);
        }
    }
}

pub(crate) fn check_entries(
    manifest: &Manifest,
    entries: &BTreeMap<String, Vec<u8>>,
) -> IntegrityReport {
    let mut report = IntegrityReport::default();

    for (name, expected) in &manifest.digests {
        match entries.get(name) {
            None => report.mismatches.push(Mismatch {
                entry: name.clone(),
                kind: MismatchKind::Missing,
            }),
            Some(data) => {
                let actual = digest(data).to_hex();
                if actual.eq_ignore_ascii_case(expected) {
                    report.verified += 1;
                } else {
                    report.mismatches.push(Mismatch {
                        entry: name.clone(),
                        kind: MismatchKind::DigestMismatch {
                            expected: expected.clone(),
                            actual,
                        },
                    });
                }
            }
        }
    }

    for name in entries.keys() {
        if name != MANIFEST_ENTRY && !manifest.digests.contains_key(name) {
            report.mismatches.push(Mismatch {
                entry: name.clone(),
                kind: MismatchKind::Untracked,
            });
        }
    }

    for m in &report.mismatches {
        debug!(mismatch = %m, "integrity check failed for entry");
    }
    report
}

/// Source of trusted public keys, looked up by signer name
pub trait KeyResolver {
    /// `Ok(None)` when no key is known for `signer`
    fn resolve(&self, signer: &str) -> PackageResult<Option<VerifyingKey>>;
}

/// Resolver that knows no keys
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeys;

impl KeyResolver for NoKeys {
    fn resolve(&self, _signer: &str) -> PackageResult<Option<VerifyingKey>> {
        Ok(None)
    }
}

impl KeyResolver for BTreeMap<String, VerifyingKey> {
    fn resolve(&self, signer: &str) -> PackageResult<Option<VerifyingKey>> {
        Ok(self.get(signer).copied())
    }
}

impl KeyResolver for HashMap<String, VerifyingKey> {
    fn resolve(&self, signer: &str) -> PackageResult<Option<VerifyingKey>> {
        Ok(self.get(signer).copied())
    }
}

/// Signature dimension of a verification report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    Unsigned,
    Verified {
        signer: String,
    },
    Rejected {
        signer: String,
        reason: String,
    },
    /// No trusted key for the signer. `embedded_key_consistent` is `None`
    /// when the block carries no public key of its own.
    KeyUnavailable {
        signer: String,
        embedded_key_consistent: Option<bool>,
    },
}

impl fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned => f.write_str("unsigned"),
            Self::Verified { signer } => write!(f, "valid (signed by '{signer}')"),
            Self::Rejected { signer, reason } => {
                write!(f, "INVALID (signer '{signer}'): {reason}")
            }
            Self::KeyUnavailable {
                signer,
                embedded_key_consistent,
            } => {
                write!(f, "not verified: no trusted public key for signer '{signer}'")?;
                match embedded_key_consistent {
                    Some(true) => f.write_str(" (consistent with its embedded key)"),
                    Some(false) => f.write_str(" (does NOT match its embedded key)"),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Which non-verified outcomes a caller is willing to accept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub allow_unsigned: bool,
    pub allow_unknown_signer: bool,
}

impl VerifyPolicy {
    pub fn strict() -> Self {
        Self::default()
    }
}

/// Result of verifying one archive across both dimensions
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub path: PathBuf,
    pub manifest: Manifest,
    pub integrity: IntegrityReport,
    pub signature: SignatureStatus,
}

impl VerificationReport {
    /// Integrity holds and the signature verified against a trusted key
    pub fn is_trusted(&self) -> bool {
        self.integrity.ok() && matches!(self.signature, SignatureStatus::Verified { .. })
    }

    pub fn is_acceptable(&self, policy: &VerifyPolicy) -> bool {
        if !self.integrity.ok() {
            return false;
        }
        match &self.signature {
            SignatureStatus::Verified { .. } => true,
            SignatureStatus::Unsigned => policy.allow_unsigned,
            SignatureStatus::KeyUnavailable {
                embedded_key_consistent,
                ..
            } => policy.allow_unknown_signer && *embedded_key_consistent != Some(false),
            SignatureStatus::Rejected { .. } => false,
        }
    }

    pub fn integrity_summary(&self) -> String {
        if self.integrity.ok() {
            format!("OK ({} entries verified)", self.integrity.verified)
        } else {
            let details: Vec<String> = self.integrity.mismatches.iter().map(|m| m.to_string()).collect();
            format!(
                "FAILED ({} mismatches): {}",
                self.integrity.mismatches.len(),
                details.join("; ")
            )
        }
    }
}

/// Verify integrity and signature of an archive.
///
/// Tampering, missing signatures and unknown signers are reported in the
/// returned value. Only unreadable archives and key lookup faults are errors.
pub fn verify_archive(path: &Path, keys: &dyn KeyResolver) -> PackageResult<VerificationReport> {
    let (entries, duplicates) = read_entries_with_duplicates(path)?;
    let manifest = manifest_from_entries(path, &entries)?;
    let mut integrity = check_entries(&manifest, &entries);
    report_duplicates(&mut integrity, duplicates);

    let signature = match manifest.signature.as_ref() {
        None => SignatureStatus::Unsigned,
        Some(block) => {
            let signer = get_signer_name(block).to_string();
            match keys.resolve(&signer)? {
                Some(key) => match verify_signature(&manifest, &key) {
                    SignatureVerdict::Valid => SignatureStatus::Verified { signer },
                    SignatureVerdict::Missing => SignatureStatus::Unsigned,
                    SignatureVerdict::Invalid(reason) => SignatureStatus::Rejected { signer, reason },
                },
                None => SignatureStatus::KeyUnavailable {
                    embedded_key_consistent: block
                        .public_key
                        .as_ref()
                        .map(|_| verify_embedded(&manifest).is_valid()),
                    signer,
                },
            }
        }
    };

    if !integrity.ok() {
        warn!(
            path = %path.display(),
            mismatches = integrity.mismatches.len(),
            "archive failed integrity check"
        );
    }
    if let SignatureStatus::Rejected { signer, reason } = &signature {
        warn!(path = %path.display(), %signer, %reason, "archive signature rejected");
    }

    Ok(VerificationReport {
        path: path.to_path_buf(),
        manifest,
        integrity,
        signature,
    })
}

fn manifest_from_entries(path: &Path, entries: &BTreeMap<String, Vec<u8>>) -> PackageResult<Manifest> {
    let bytes = entries.get(MANIFEST_ENTRY).ok_or_else(|| {
        PackageError::CorruptArchive(format!("{} has no {MANIFEST_ENTRY}", path.display()))
    })?;
    Manifest::from_json(bytes).map_err(|e| {
        PackageError::CorruptArchive(format!(
            "{MANIFEST_ENTRY} in {} is undecodable: {e}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ENVIRONMENT_ENTRY, STDOUT_ENTRY, STEPS_ENTRY};

    fn entries() -> BTreeMap<String, Vec<u8>> {
        let mut e = BTreeMap::new();
        e.insert(STEPS_ENTRY.to_string(), b"a\nb\n".to_vec());
        e.insert(ENVIRONMENT_ENTRY.to_string(), b"{}".to_vec());
        e.insert(STDOUT_ENTRY.to_string(), b"hello".to_vec());
        e
    }

    fn manifest_for(entries: &BTreeMap<String, Vec<u8>>) -> Manifest {
        let mut m = Manifest::new("python demo.py");
        m.digests = entries
            .iter()
            .map(|(k, v)| (k.clone(), digest(v).to_hex()))
            .collect();
        m
    }

    #[test]
    fn clean_entries_pass() {
        let e = entries();
        let report = check_entries(&manifest_for(&e), &e);
        assert!(report.ok());
        assert_eq!(report.verified, 3);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn all_mismatch_kinds_are_collected() {
        let e = entries();
        let m = manifest_for(&e);

        let mut tampered = e.clone();
        tampered.remove(ENVIRONMENT_ENTRY);
        tampered.insert(STDOUT_ENTRY.to_string(), b"hellO".to_vec());
        tampered.insert("extra.bin".to_string(), vec![1, 2, 3]);
        tampered.insert(MANIFEST_ENTRY.to_string(), b"{}".to_vec());

        let report = check_entries(&m, &tampered);
        assert!(!report.ok());
        assert_eq!(report.verified, 1);
        assert_eq!(report.mismatches.len(), 3);
        assert!(report.mismatches.contains(&Mismatch {
            entry: ENVIRONMENT_ENTRY.to_string(),
            kind: MismatchKind::Missing,
        }));
        assert!(report.mismatches.contains(&Mismatch {
            entry: "extra.bin".to_string(),
            kind: MismatchKind::Untracked,
        }));
        assert!(report
            .mismatches
            .iter()
            .any(|m| m.entry == STDOUT_ENTRY && matches!(m.kind, MismatchKind::DigestMismatch { .. })));

        match report.into_result() {
            Err(PackageError::IntegrityMismatch(names)) => assert_eq!(names.len(), 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn uppercase_digest_is_accepted() {
        let e = entries();
        let mut m = manifest_for(&e);
        for v in m.digests.values_mut() {
            *v = v.to_uppercase();
        }
        assert!(check_entries(&m, &e).ok());
    }

    #[test]
    fn policy_decisions() {
        let e = entries();
        let report = |signature| VerificationReport {
            path: PathBuf::from("x.epi"),
            manifest: manifest_for(&e),
            integrity: IntegrityReport::default(),
            signature,
        };
        let strict = VerifyPolicy::strict();
        let lenient = VerifyPolicy {
            allow_unsigned: true,
            allow_unknown_signer: true,
        };

        let unsigned = report(SignatureStatus::Unsigned);
        assert!(!unsigned.is_acceptable(&strict));
        assert!(unsigned.is_acceptable(&lenient));
        assert!(!unsigned.is_trusted());

        let unknown = report(SignatureStatus::KeyUnavailable {
            signer: "ci".to_string(),
            embedded_key_consistent: Some(false),
        });
        assert!(!unknown.is_acceptable(&lenient));

        let rejected = report(SignatureStatus::Rejected {
            signer: "ci".to_string(),
            reason: "bad".to_string(),
        });
        assert!(!rejected.is_acceptable(&lenient));

        let verified = report(SignatureStatus::Verified {
            signer: "ci".to_string(),
        });
        assert!(verified.is_trusted());
        assert!(verified.is_acceptable(&strict));
    }

    #[test]
    fn report_always_explains_each_dimension() {
        let e = entries();
        let r = VerificationReport {
            path: PathBuf::from("x.epi"),
            manifest: manifest_for(&e),
            integrity: IntegrityReport {
                verified: 2,
                mismatches: vec![Mismatch {
                    entry: STDOUT_ENTRY.to_string(),
                    kind: MismatchKind::Missing,
                }],
            },
            signature: SignatureStatus::KeyUnavailable {
                signer: "default".to_string(),
                embedded_key_consistent: Some(true),
            },
        };
        assert_eq!(
            r.integrity_summary(),
            "FAILED (1 mismatches): stdout.log: listed in manifest but missing"
        );
        assert!(r
            .signature
            .to_string()
            .contains("no trusted public key for signer 'default'"));
    }
}
