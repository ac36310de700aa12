//! Named Ed25519 keypairs on local disk.
//!
//! Layout under the store directory:
//!
//!   <name>.key   base64 32-byte seed, mode 0600 on Unix
//!   <name>.pub   base64 32-byte public key
//!
//! The directory is passed in explicitly; nothing here reads process-wide
//! configuration.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use evidence_package::{decode_public_key, encode_public_key, KeyResolver, PackageError, PackageResult};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const PRIVATE_EXT: &str = "key";
const PUBLIC_EXT: &str = "pub";

/// Conventional name of the key used when none is given
pub const DEFAULT_KEY_NAME: &str = "default";

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("key already exists: {0} (use overwrite to replace it)")]
    AlreadyExists(String),
    #[error("invalid key name: {0:?}")]
    InvalidName(String),
    #[error("invalid key material for {name}: {reason}")]
    InvalidKey { name: String, reason: String },
    #[error("keystore I/O failure: {0}")]
    Io(#[from] io::Error),
}

pub type KeystoreResult<T> = Result<T, KeystoreError>;

/// Listing entry for one key name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub name: String,
    pub has_private: bool,
    pub has_public: bool,
}

#[derive(Debug, Clone)]
pub struct Keystore {
    dir: PathBuf,
}

impl Keystore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True if either half of the named keypair is stored
    pub fn contains(&self, name: &str) -> KeystoreResult<bool> {
        Ok(self.private_path(name)?.exists() || self.public_path(name)?.exists())
    }

    /// Generate and persist a new keypair, returning its public key
    pub fn generate(&self, name: &str, overwrite: bool) -> KeystoreResult<VerifyingKey> {
        if !overwrite && self.contains(name)? {
            return Err(KeystoreError::AlreadyExists(name.to_string()));
        }

        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut seed[..]);
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();

        let encoded = Zeroizing::new(BASE64.encode(&seed[..]));
        let private_path = self.private_path(name)?;
        let public_path = self.public_path(name)?;
        let staged_private = self.stage(encoded.as_bytes(), 0o600)?;
        let staged_public = self.stage(encode_public_key(&verifying_key).as_bytes(), 0o644)?;

        // Public half lands first. If the private rename fails the new public
        // file is removed, so load_public derives from whatever private key remains.
        staged_public.persist(&public_path).map_err(|e| e.error)?;
        if let Err(e) = staged_private.persist(&private_path) {
            if let Err(cleanup) = fs::remove_file(&public_path) {
                warn!(name, error = %cleanup, "could not roll back public key after failed write");
            }
            return Err(e.error.into());
        }

        info!(name, dir = %self.dir.display(), overwrite, "generated ed25519 keypair");
        Ok(verifying_key)
    }

    /// Generate `name` unless it already exists. Returns true when a key was created.
    pub fn generate_if_missing(&self, name: &str) -> KeystoreResult<bool> {
        if self.contains(name)? {
            return Ok(false);
        }
        self.generate(name, false)?;
        Ok(true)
    }

    /// All key names, sorted, with which halves are present
    pub fn list(&self) -> KeystoreResult<Vec<KeyInfo>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys: BTreeMap<String, KeyInfo> = BTreeMap::new();
        for entry in read_dir {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            if validate_name(stem).is_err() {
                continue;
            }

            let info = keys.entry(stem.to_string()).or_insert_with(|| KeyInfo {
                name: stem.to_string(),
                has_private: false,
                has_public: false,
            });
            match ext {
                PRIVATE_EXT => info.has_private = true,
                PUBLIC_EXT => info.has_public = true,
                _ => {}
            }
        }

        Ok(keys.into_values().filter(|k| k.has_private || k.has_public).collect())
    }

    pub fn load_private(&self, name: &str) -> KeystoreResult<SigningKey> {
        let path = self.private_path(name)?;
        let text = Zeroizing::new(read_key_file(&path, name)?);
        let bytes = Zeroizing::new(BASE64.decode(text.trim()).map_err(|e| KeystoreError::InvalidKey {
            name: name.to_string(),
            reason: format!("private key is not valid base64: {e}"),
        })?);
        if bytes.len() != 32 {
            return Err(KeystoreError::InvalidKey {
                name: name.to_string(),
                reason: format!("private key must be 32 bytes, got {}", bytes.len()),
            });
        }
        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(&bytes);
        Ok(SigningKey::from_bytes(&seed))
    }

    /// Public half of `name`; derived from the private key if only that is stored
    pub fn load_public(&self, name: &str) -> KeystoreResult<VerifyingKey> {
        let path = self.public_path(name)?;
        if path.exists() {
            let text = read_key_file(&path, name)?;
            return decode_public_key(&text).map_err(|e| invalid_key(name, e));
        }
        let key = self.load_private(name)?;
        debug!(name, "public key file absent, derived from private key");
        Ok(key.verifying_key())
    }

    /// Public key as base64 text for out-of-band distribution
    pub fn export_public(&self, name: &str) -> KeystoreResult<String> {
        Ok(encode_public_key(&self.load_public(name)?))
    }

    /// Store a public key received out of band.
    ///
    /// A name that holds a private key only accepts its own public half.
    pub fn import_public(&self, name: &str, text: &str, overwrite: bool) -> KeystoreResult<VerifyingKey> {
        let key = decode_public_key(text).map_err(|e| invalid_key(name, e))?;
        let path = self.public_path(name)?;
        if !overwrite && self.contains(name)? {
            return Err(KeystoreError::AlreadyExists(name.to_string()));
        }
        if self.private_path(name)?.exists() {
            let local = self.load_private(name)?.verifying_key();
            if local != key {
                return Err(KeystoreError::InvalidKey {
                    name: name.to_string(),
                    reason: "a different private key is stored under this name; remove it or pick another name"
                        .to_string(),
                });
            }
        }
        self.stage(encode_public_key(&key).as_bytes(), 0o644)?
            .persist(&path)
            .map_err(|e| e.error)?;
        info!(name, "imported public key");
        Ok(key)
    }

    fn private_path(&self, name: &str) -> KeystoreResult<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.{PRIVATE_EXT}")))
    }

    fn public_path(&self, name: &str) -> KeystoreResult<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.{PUBLIC_EXT}")))
    }

    fn ensure_dir(&self) -> io::Result<()> {
        if self.dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    /// Write `data` to a temp file in the store directory, ready to be renamed into place
    fn stage(&self, data: &[u8], mode: u32) -> io::Result<NamedTempFile> {
        self.ensure_dir()?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".key-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }
}

impl KeyResolver for Keystore {
    fn resolve(&self, signer: &str) -> PackageResult<Option<VerifyingKey>> {
        match self.load_public(signer) {
            Ok(key) => Ok(Some(key)),
            Err(KeystoreError::NotFound(_)) | Err(KeystoreError::InvalidName(_)) => Ok(None),
            Err(e) => Err(PackageError::KeyResolution(e.to_string())),
        }
    }
}

/// Names become file stems, so they are restricted to a safe alphabet
fn validate_name(name: &str) -> KeystoreResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(KeystoreError::InvalidName(name.to_string()))
    }
}

fn read_key_file(path: &Path, name: &str) -> KeystoreResult<String> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => KeystoreError::NotFound(name.to_string()),
        _ => KeystoreError::Io(e),
    })
}

fn invalid_key(name: &str, e: PackageError) -> KeystoreError {
    KeystoreError::InvalidKey {
        name: name.to_string(),
        reason: e.to_string(),
    }
}
