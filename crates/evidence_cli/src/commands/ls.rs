use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::*;
use evidence_package::{read_manifest, ARCHIVE_EXTENSION};

use crate::config::CliConfig;

#[derive(Debug)]
struct ArchiveSummary {
    path: PathBuf,
    size: u64,
    signer: Option<String>,
    readable: bool,
}

pub fn run(config: &CliConfig) -> Result<()> {
    let archives = scan(&config.recordings_dir)?;
    if archives.is_empty() {
        println!(
            "{}",
            format!("no archives in {}", config.recordings_dir.display()).yellow()
        );
        return Ok(());
    }

    for a in archives {
        let name = a
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let signer = match (a.readable, a.signer) {
            (false, _) => "unreadable".bright_red(),
            (true, Some(s)) => s.bright_green(),
            (true, None) => "unsigned".yellow(),
        };
        println!("{:<48} {:>10}  {}", name, human_size(a.size), signer);
    }
    Ok(())
}

fn scan(dir: &Path) -> Result<Vec<ArchiveSummary>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
    };

    let mut archives = Vec::new();
    for entry in read_dir {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXTENSION) || !path.is_file() {
            continue;
        }
        let size = fs::metadata(&path)?.len();
        let (signer, readable) = match read_manifest(&path) {
            Ok(m) => (m.signature.map(|s| s.signer), true),
            Err(_) => (None, false),
        };
        archives.push(ArchiveSummary {
            path,
            size,
            signer,
            readable,
        });
    }
    archives.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(archives)
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evidence_package::{pack, Manifest, ENVIRONMENT_ENTRY, STEPS_ENTRY};

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn scan_lists_only_archives() {
        let dir = tempfile::tempdir().unwrap();
        let rec = dir.path().join("rec");
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join(STEPS_ENTRY), b"").unwrap();
        fs::write(src.join(ENVIRONMENT_ENTRY), b"{}").unwrap();

        pack(&src, Manifest::new("b"), &rec.join("b.epi")).unwrap();
        pack(&src, Manifest::new("a"), &rec.join("a.epi")).unwrap();
        fs::write(rec.join("notes.txt"), b"x").unwrap();
        fs::write(rec.join("broken.epi"), b"not gzip").unwrap();

        let found = scan(&rec).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|a| a.path.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, ["a.epi", "b.epi", "broken.epi"]);
        assert!(found[0].readable && found[0].signer.is_none());
        assert!(!found[2].readable);
    }

    #[test]
    fn missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan(&dir.path().join("nope")).unwrap().is_empty());
    }
}
