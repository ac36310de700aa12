// Package builder - assembles an evidence archive from a finalized recording directory

use crate::container::write_archive;
use crate::hash::digest;
use crate::manifest::Manifest;
use crate::signer::PackageSigner;
use crate::{
    PackageError, PackageResult, ENVIRONMENT_ENTRY, MANIFEST_ENTRY, STDERR_ENTRY, STDOUT_ENTRY,
    STEPS_ENTRY, VIEWER_ENTRY,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Builder for evidence archives
pub struct PackBuilder {
    source_dir: PathBuf,
    template: Manifest,
    viewer_asset: Option<PathBuf>,
    signer: Option<PackageSigner>,
}

impl PackBuilder {
    pub fn new(source_dir: impl Into<PathBuf>, template: Manifest) -> Self {
        Self {
            source_dir: source_dir.into(),
            template,
            viewer_asset: None,
            signer: None,
        }
    }

    /// Bundle a static viewer file verbatim as `viewer.html`
    pub fn viewer_asset(mut self, path: impl Into<PathBuf>) -> Self {
        self.viewer_asset = Some(path.into());
        self
    }

    /// Sign the sealed manifest before the archive is written
    pub fn sign_with(mut self, signer: PackageSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Collect entries, seal the manifest and write the archive atomically
    pub fn write(self, output: &Path) -> PackageResult<Manifest> {
        let mut entries = collect_entries(&self.source_dir)?;

        if let Some(ref viewer) = self.viewer_asset {
            let bytes = fs::read(viewer).map_err(|e| read_error(viewer, e))?;
            if entries.insert(VIEWER_ENTRY.to_string(), bytes).is_some() {
                debug!(viewer = %viewer.display(), "explicit viewer asset replaces the one in the source directory");
            }
        }

        let mut manifest = self.template;
        if !manifest.digests.is_empty() {
            warn!(
                stale = manifest.digests.len(),
                "manifest template carried digests; they are recomputed"
            );
        }
        if manifest.signature.take().is_some() {
            debug!("dropping signature carried by the manifest template");
        }
        manifest.digests = entries
            .iter()
            .map(|(name, data)| (name.clone(), digest(data).to_hex()))
            .collect();

        if let Some(ref signer) = self.signer {
            manifest = signer.sign(&manifest)?;
        }

        write_archive(output, &manifest, &entries)?;
        info!(
            output = %output.display(),
            entries = entries.len(),
            signed = manifest.is_signed(),
            "packed evidence archive"
        );
        Ok(manifest)
    }
}

/// Pack an unsigned archive
pub fn pack(source_dir: &Path, template: Manifest, output: &Path) -> PackageResult<Manifest> {
    PackBuilder::new(source_dir, template).write(output)
}

/// Pack and sign in one atomic step
pub fn pack_signed(
    source_dir: &Path,
    template: Manifest,
    output: &Path,
    signer: PackageSigner,
) -> PackageResult<Manifest> {
    PackBuilder::new(source_dir, template)
        .sign_with(signer)
        .write(output)
}

/// Read every regular file below `dir` into an entry map keyed by relative `/` path.
/// Symbolic links are rejected rather than followed.
///
/// `steps.jsonl` and `env.json` are required; absent stdout/stderr logs become
/// zero-byte entries.
fn collect_entries(dir: &Path) -> PackageResult<BTreeMap<String, Vec<u8>>> {
    if !dir.is_dir() {
        return Err(PackageError::NotFound(format!(
            "source directory {}",
            dir.display()
        )));
    }

    let mut entries = BTreeMap::new();
    walk(dir, dir, &mut entries)?;

    if entries.contains_key(MANIFEST_ENTRY) {
        return Err(PackageError::InvalidInput(format!(
            "{} contains {MANIFEST_ENTRY}, which is reserved",
            dir.display()
        )));
    }
    for required in [STEPS_ENTRY, ENVIRONMENT_ENTRY] {
        if !entries.contains_key(required) {
            return Err(PackageError::NotFound(format!(
                "{required} in {}",
                dir.display()
            )));
        }
    }
    for optional in [STDOUT_ENTRY, STDERR_ENTRY] {
        entries.entry(optional.to_string()).or_insert_with(|| {
            debug!(entry = optional, "no log captured, packing empty entry");
            Vec::new()
        });
    }
    Ok(entries)
}

fn walk(root: &Path, dir: &Path, entries: &mut BTreeMap<String, Vec<u8>>) -> PackageResult<()> {
    let mut children: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| read_error(dir, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    children.sort();

    for path in children {
        let meta = fs::symlink_metadata(&path).map_err(|e| read_error(&path, e))?;
        if meta.file_type().is_symlink() {
            return Err(PackageError::InvalidInput(format!(
                "{} is a symbolic link; recordings must contain regular files only",
                path.display()
            )));
        }
        if meta.is_dir() {
            walk(root, &path, entries)?;
        } else if meta.is_file() {
            let name = entry_name(root, &path)?;
            let data = fs::read(&path).map_err(|e| read_error(&path, e))?;
            debug!(entry = %name, bytes = data.len(), "collected entry");
            entries.insert(name, data);
        }
    }
    Ok(())
}

fn entry_name(root: &Path, path: &Path) -> PackageResult<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        PackageError::InvalidInput(format!("{} escapes {}", path.display(), root.display()))
    })?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn read_error(path: &Path, e: std::io::Error) -> PackageError {
    match e.kind() {
        std::io::ErrorKind::NotFound => PackageError::NotFound(path.display().to_string()),
        _ => PackageError::Io(e),
    }
}
