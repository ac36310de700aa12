//! Process-level settings, resolved once from the environment.

use std::path::PathBuf;

use evidence_keystore::DEFAULT_KEY_NAME;

pub const KEYS_DIR_VAR: &str = "EPI_KEYS_DIR";
pub const RECORDINGS_DIR_VAR: &str = "EPI_RECORDINGS_DIR";
pub const SIGNER_VAR: &str = "EPI_SIGNER";
pub const ALLOW_UNSIGNED_VAR: &str = "EPI_ALLOW_UNSIGNED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    pub keys_dir: PathBuf,
    pub recordings_dir: PathBuf,
    pub signer: String,
    pub allow_unsigned: bool,
}

impl CliConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve settings through `lookup`; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let keys_dir = get(KEYS_DIR_VAR).map(PathBuf::from).unwrap_or_else(|| {
            match get("HOME") {
                Some(home) => PathBuf::from(home).join(".epi").join("keys"),
                None => PathBuf::from("./.epi/keys"),
            }
        });

        Self {
            keys_dir,
            recordings_dir: get(RECORDINGS_DIR_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./epi-recordings")),
            signer: get(SIGNER_VAR).unwrap_or_else(|| DEFAULT_KEY_NAME.to_string()),
            allow_unsigned: get(ALLOW_UNSIGNED_VAR).as_deref().map(truthy).unwrap_or(false),
        }
    }
}

fn truthy(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
}
