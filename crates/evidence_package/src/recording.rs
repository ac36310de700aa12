//! Producer-side helpers for the recording directory layout.
//!
//! Anything that writes `steps.jsonl` and `env.json` into a directory can be
//! packed; these helpers are one way to do it.

use crate::{PackageError, PackageResult, ENVIRONMENT_ENTRY, STEPS_ENTRY};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One captured event. Index order is execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    #[serde(default)]
    pub content: Value,
}

/// Append-only writer for `steps.jsonl`
pub struct StepLog {
    path: PathBuf,
    writer: BufWriter<File>,
    next_index: u64,
}

impl StepLog {
    /// Create (or truncate) the step log inside `dir`
    pub fn create(dir: &Path) -> PackageResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(STEPS_ENTRY);
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_index: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record and return its index
    pub fn append(&mut self, kind: impl Into<String>, content: Value) -> PackageResult<u64> {
        let record = StepRecord {
            index: self.next_index,
            timestamp: Utc::now(),
            kind: kind.into(),
            content,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.next_index += 1;
        Ok(record.index)
    }

    pub fn flush(&mut self) -> PackageResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush to disk and return the number of records written
    pub fn finish(mut self) -> PackageResult<u64> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.next_index)
    }
}

/// Parse a step log, requiring indices to increase strictly
pub fn read_steps(bytes: &[u8]) -> PackageResult<Vec<StepRecord>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| PackageError::CorruptArchive(format!("{STEPS_ENTRY} is not UTF-8: {e}")))?;

    let mut steps: Vec<StepRecord> = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: StepRecord = serde_json::from_str(line).map_err(|e| {
            PackageError::CorruptArchive(format!("{STEPS_ENTRY} line {}: {e}", line_no + 1))
        })?;
        if let Some(prev) = steps.last() {
            if record.index <= prev.index {
                return Err(PackageError::CorruptArchive(format!(
                    "{STEPS_ENTRY} line {}: index {} does not follow {}",
                    line_no + 1,
                    record.index,
                    prev.index
                )));
            }
        }
        steps.push(record);
    }
    Ok(steps)
}

pub const REDACTED: &str = "***REDACTED***";

const SECRET_MARKERS: [&str; 6] = ["KEY", "SECRET", "TOKEN", "PASSWORD", "PASSWD", "CREDENTIAL"];

/// Environment state at record time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub captured_at: DateTime<Utc>,
    pub os: String,
    pub os_family: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<BTreeMap<String, String>>,
}

impl EnvironmentSnapshot {
    /// Capture the current process environment. Values of secret-looking variables are redacted.
    pub fn capture(include_env_vars: bool) -> Self {
        let env_vars = include_env_vars.then(|| {
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .map(|(k, v)| {
                    if is_secret_name(&k) {
                        (k, REDACTED.to_string())
                    } else {
                        (k, v)
                    }
                })
                .collect()
        });

        Self {
            captured_at: Utc::now(),
            os: std::env::consts::OS.to_string(),
            os_family: std::env::consts::FAMILY.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            working_dir: std::env::current_dir()
                .ok()
                .map(|p| p.to_string_lossy().into_owned()),
            env_vars,
        }
    }

    /// Write `env.json` into `dir`
    pub fn write_to(&self, dir: &Path) -> PackageResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(ENVIRONMENT_ENTRY);
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }
}

fn is_secret_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SECRET_MARKERS.iter().any(|m| upper.contains(m))
}
