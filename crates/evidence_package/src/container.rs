// Evidence archive container: gzip-compressed tar with a manifest entry
//
// Archives are written to a temporary file next to the destination, checked,
// and then renamed into place. Readers see either the old archive or the new
// one, never a partial file.

use crate::manifest::Manifest;
use crate::signer::PackageSigner;
use crate::verifier::check_entries;
use crate::{PackageError, PackageResult, MANIFEST_ENTRY};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Largest single entry accepted when reading an archive
pub const MAX_ENTRY_SIZE: u64 = 1 << 30;

/// Largest total of entry payloads accepted when reading an archive
pub const MAX_ARCHIVE_SIZE: u64 = 4 << 30;

// Upper bound on pre-allocation; header sizes are not trusted.
const READ_CHUNK: u64 = 1 << 20;

/// Name and size of one archive entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub size: u64,
}

/// Read the manifest entry of an archive
pub fn read_manifest(path: &Path) -> PackageResult<Manifest> {
    let bytes = match read_entry(path, MANIFEST_ENTRY) {
        Ok(bytes) => bytes,
        Err(PackageError::EntryNotFound(_)) => {
            return Err(PackageError::CorruptArchive(format!(
                "{} has no {MANIFEST_ENTRY}",
                path.display()
            )))
        }
        Err(e) => return Err(e),
    };
    decode_manifest(path, &bytes)
}

/// Read one entry's bytes. A repeated name yields its first copy.
pub fn read_entry(path: &Path, name: &str) -> PackageResult<Vec<u8>> {
    let mut found = None;
    scan_archive(path, |entry_name, data| {
        if entry_name == name {
            found = Some(data);
            false
        } else {
            true
        }
    })?;
    found.ok_or_else(|| PackageError::EntryNotFound(name.to_string()))
}

/// Read every entry, keyed by name. Duplicate names make the archive corrupt.
pub fn read_entries(path: &Path) -> PackageResult<BTreeMap<String, Vec<u8>>> {
    let (entries, duplicates) = read_entries_with_duplicates(path)?;
    if let Some(name) = duplicates.first() {
        return Err(PackageError::CorruptArchive(format!(
            "duplicate entry {name} in {}",
            path.display()
        )));
    }
    Ok(entries)
}

/// Read every entry, keeping the first copy of a repeated name and
/// returning the repeated names separately.
pub(crate) fn read_entries_with_duplicates(
    path: &Path,
) -> PackageResult<(BTreeMap<String, Vec<u8>>, Vec<String>)> {
    let mut entries = BTreeMap::new();
    let mut duplicates = Vec::new();
    scan_archive(path, |name, data| {
        if entries.contains_key(&name) {
            duplicates.push(name);
        } else {
            entries.insert(name, data);
        }
        true
    })?;
    Ok((entries, duplicates))
}

/// List entry names and sizes in archive order
pub fn list_entries(path: &Path) -> PackageResult<Vec<EntryInfo>> {
    let mut out = Vec::new();
    scan_archive(path, |name, data| {
        out.push(EntryInfo {
            name,
            size: data.len() as u64,
        });
        true
    })?;
    Ok(out)
}

/// Replace the manifest of a sealed archive, keeping every other entry byte-for-byte.
///
/// Not safe against a concurrent writer on the same path; callers serialize.
pub fn replace_manifest(path: &Path, manifest: &Manifest) -> PackageResult<()> {
    let mut entries = read_entries(path)?;
    entries.remove(MANIFEST_ENTRY);
    write_archive(path, manifest, &entries)?;
    info!(path = %path.display(), signed = manifest.is_signed(), "replaced manifest");
    Ok(())
}

/// Sign (or re-sign) an archive in place and return the new manifest
pub fn resign(path: &Path, signer: &PackageSigner) -> PackageResult<Manifest> {
    let manifest = read_manifest(path)?;
    if let Some(previous) = manifest.signature.as_ref() {
        debug!(previous = %previous.signer, "replacing existing signature");
    }
    let signed = signer.sign(&manifest)?;
    replace_manifest(path, &signed)?;
    Ok(signed)
}

/// Write `manifest` plus `entries` to `output` atomically.
///
/// The staged file is re-read and checked against the manifest digests
/// before it replaces `output`.
pub(crate) fn write_archive(
    output: &Path,
    manifest: &Manifest,
    entries: &BTreeMap<String, Vec<u8>>,
) -> PackageResult<()> {
    if entries.contains_key(MANIFEST_ENTRY) {
        return Err(PackageError::InvalidInput(format!(
            "{MANIFEST_ENTRY} is reserved for the manifest"
        )));
    }

    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let staged = tempfile::Builder::new()
        .prefix(".epi-")
        .suffix(".tmp")
        .tempfile_in(parent)?;

    let manifest_json = manifest.to_json_pretty()?;
    {
        let encoder = GzEncoder::new(staged.as_file(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        append_entry(&mut builder, MANIFEST_ENTRY, manifest_json.as_bytes())?;
        for (name, data) in entries {
            append_entry(&mut builder, name, data)?;
        }
        builder.into_inner()?.finish()?;
    }
    staged.as_file().sync_all()?;

    let written = read_entries(staged.path())?;
    let staged_manifest = match written.get(MANIFEST_ENTRY) {
        Some(bytes) => decode_manifest(staged.path(), bytes)?,
        None => {
            return Err(PackageError::CorruptArchive(
                "staged archive lost its manifest".to_string(),
            ))
        }
    };
    let report = check_entries(&staged_manifest, &written);
    if !report.ok() {
        warn!(
            path = %output.display(),
            mismatches = report.mismatches.len(),
            "staged archive failed integrity check, discarding"
        );
        return Err(PackageError::IntegrityMismatch(
            report.mismatched_entries().into_iter().map(String::from).collect(),
        ));
    }

    // tempfile stages with 0600; archives are meant to be shared.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o644))?;
    }

    staged.persist(output).map_err(|e| PackageError::Io(e.error))?;
    Ok(())
}

fn append_entry<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder.append_data(&mut header, name, data)
}

fn decode_manifest(path: &Path, bytes: &[u8]) -> PackageResult<Manifest> {
    Manifest::from_json(bytes).map_err(|e| {
        PackageError::CorruptArchive(format!(
            "{MANIFEST_ENTRY} in {} is undecodable: {e}",
            path.display()
        ))
    })
}

fn open_archive(path: &Path) -> PackageResult<File> {
    File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => PackageError::NotFound(path.display().to_string()),
        _ => PackageError::Io(e),
    })
}

/// Visit regular-file entries in archive order until `visit` returns false
fn scan_archive<F>(path: &Path, mut visit: F) -> PackageResult<()>
where
    F: FnMut(String, Vec<u8>) -> bool,
{
    let corrupt = |e: io::Error| PackageError::CorruptArchive(format!("{}: {e}", path.display()));

    let file = open_archive(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut total: u64 = 0;
    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            continue;
        }
        if !entry_type.is_file() {
            return Err(PackageError::CorruptArchive(format!(
                "{}: unsupported entry type {entry_type:?}",
                path.display()
            )));
        }

        let name = entry
            .path()
            .map_err(corrupt)?
            .to_string_lossy()
            .replace('\\', "/");
        let declared = entry.size();
        if declared > MAX_ENTRY_SIZE {
            return Err(PackageError::CorruptArchive(format!(
                "{}: entry {name} declares {declared} bytes, limit is {MAX_ENTRY_SIZE}",
                path.display()
            )));
        }
        total = total.saturating_add(declared);
        if total > MAX_ARCHIVE_SIZE {
            return Err(PackageError::CorruptArchive(format!(
                "{}: entries exceed {MAX_ARCHIVE_SIZE} bytes in total",
                path.display()
            )));
        }

        let mut data = Vec::with_capacity(declared.min(READ_CHUNK) as usize);
        (&mut entry)
            .take(declared)
            .read_to_end(&mut data)
            .map_err(corrupt)?;
        if data.len() as u64 != declared {
            return Err(PackageError::CorruptArchive(format!(
                "{}: entry {name} is truncated ({} of {declared} bytes)",
                path.display(),
                data.len()
            )));
        }
        if !visit(name, data) {
            break;
        }
    }
    Ok(())
}
