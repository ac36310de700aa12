// Tamper-evident evidence archives for recorded workflows
// Packs step logs, environment snapshots and output logs into a single signed,
// independently verifiable archive.

pub mod builder;
pub mod canonical;
pub mod container;
pub mod hash;
pub mod manifest;
pub mod recording;
pub mod signer;
pub mod verifier;

pub use builder::{pack, pack_signed, PackBuilder};
pub use canonical::{canonicalize, to_canonical_bytes};
pub use container::{
    list_entries, read_entries, read_entry, read_manifest, replace_manifest, resign, EntryInfo,
    MAX_ARCHIVE_SIZE, MAX_ENTRY_SIZE,
};
pub use hash::{digest, digest_reader, ContentHash};
pub use manifest::{parse_metric, Manifest, ManifestBuilder, MetricValue, SignatureBlock};
pub use recording::{read_steps, EnvironmentSnapshot, StepLog, StepRecord};
pub use signer::{
    decode_public_key, encode_public_key, get_signer_name, sign_manifest, verify_embedded,
    verify_signature, PackageSigner, SignatureVerdict, ED25519,
};
pub use verifier::{
    verify_archive, verify_integrity, IntegrityReport, KeyResolver, Mismatch, MismatchKind,
    NoKeys, SignatureStatus, VerificationReport, VerifyPolicy,
};

use thiserror::Error;

/// Manifest format version for schema evolution
pub const FORMAT_VERSION: u32 = 1;

/// Conventional extension of an evidence archive
pub const ARCHIVE_EXTENSION: &str = "epi";

pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const STEPS_ENTRY: &str = "steps.jsonl";
pub const ENVIRONMENT_ENTRY: &str = "env.json";
pub const STDOUT_ENTRY: &str = "stdout.log";
pub const STDERR_ENTRY: &str = "stderr.log";
pub const VIEWER_ENTRY: &str = "viewer.html";

/// Result type for package operations
pub type PackageResult<T> = Result<T, PackageError>;

/// Errors that can occur during package operations.
///
/// Tampered, unsigned or unknown-signer archives are not errors; they are
/// reported through [`IntegrityReport`] and [`SignatureStatus`].
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("entry not found in archive: {0}")]
    EntryNotFound(String),
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),
    #[error("integrity mismatch in {} entries: {}", .0.len(), .0.join(", "))]
    IntegrityMismatch(Vec<String>),
    #[error("no signature present")]
    NoSignature,
    #[error("invalid signature: {0}")]
    SignatureInvalid(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("key resolution failed: {0}")]
    KeyResolution(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}
