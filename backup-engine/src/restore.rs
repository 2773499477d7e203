//! Restore files from a backup set.
//!
//! The ledger says which chunk holds the latest copy of each path in a set;
//! only those chunks are opened, and only the wanted members are extracted.
//! Encrypted chunks are decrypted to a scratch file beside the target first.

use crate::archive::chunk::Scratch;
use crate::offload::encrypt::{Cipher, Passphrase, ENCRYPTED_EXTENSION};
use crate::utils::{EngineError, Result};
use backup_ledger::Ledger;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use zstd::stream::read::Decoder as ZstdDecoder;

const DECRYPTED_SCRATCH: &str = ".restore-chunk";

/// What to restore and where.
#[derive(Debug, Clone)]
pub struct RestoreRequest<'a> {
    pub job_name: &'a str,
    pub set_name: &'a str,
    /// Directory holding the set's chunks
    pub set_dir: &'a Path,
    pub target: &'a Path,
    /// Relative paths to restore; empty means the whole set
    pub paths: &'a [String],
    pub passphrase: Option<&'a Passphrase>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    /// Files written, in path order
    pub restored: Vec<PathBuf>,
    /// Requested paths the set never recorded
    pub missing: Vec<String>,
    /// Recorded paths that would land outside the target
    pub refused: Vec<String>,
}

/// Restore the latest copy of each wanted path in a set under `target`.
pub fn restore(ledger: &Ledger, cipher: &dyn Cipher, request: &RestoreRequest<'_>) -> Result<RestoreReport> {
    let set = ledger
        .find_set_by_name(request.job_name, request.set_name)?
        .ok_or_else(|| {
            EngineError::NotFound(format!("set {} of job {}", request.set_name, request.job_name))
        })?;

    // completed files come oldest job first; the last chunk seen wins
    let mut latest: BTreeMap<String, String> = BTreeMap::new();
    for file in ledger.completed_files_in_set(set.id)? {
        latest.insert(file.path, file.chunk_name);
    }

    let mut report = RestoreReport::default();
    let wanted: Vec<(String, String)> = if request.paths.is_empty() {
        latest.into_iter().collect()
    } else {
        let mut wanted = Vec::new();
        for path in request.paths {
            let key = path.trim_start_matches("./").trim_start_matches('/');
            match latest.get(key) {
                Some(chunk) => wanted.push((key.to_string(), chunk.clone())),
                None => {
                    tracing::warn!(path = %path, set = %request.set_name, "path not recorded in set");
                    report.missing.push(path.clone());
                }
            }
        }
        wanted
    };

    let mut by_chunk: BTreeMap<String, BTreeMap<String, PathBuf>> = BTreeMap::new();
    for (path, chunk) in wanted {
        match confined_path(&path) {
            Some(relative) => {
                by_chunk.entry(chunk).or_default().insert(path, request.target.join(relative));
            }
            None => {
                tracing::warn!(path = %path, "refusing to restore a path outside the target");
                report.refused.push(path);
            }
        }
    }

    tracing::info!(
        job = %request.job_name,
        set = %request.set_name,
        chunks = by_chunk.len(),
        target = %request.target.display(),
        "restore started"
    );

    fs::create_dir_all(request.target)?;
    for (chunk_name, members) in &by_chunk {
        let chunk_path = request.set_dir.join(chunk_name);
        if !chunk_path.is_file() {
            return Err(EngineError::NotFound(format!("chunk {}", chunk_path.display())));
        }

        let written = if is_encrypted(chunk_name) {
            let passphrase = request.passphrase.ok_or_else(|| {
                EngineError::Encryption(format!("{} is encrypted and no passphrase is set", chunk_name))
            })?;
            let scratch = Scratch(request.target.join(DECRYPTED_SCRATCH));
            cipher.decrypt(&chunk_path, &scratch.0, passphrase)?;
            extract_members(&scratch.0, members)?
        } else {
            extract_members(&chunk_path, members)?
        };

        tracing::debug!(chunk = %chunk_name, files = written.len(), "chunk restored");
        report.restored.extend(written);
    }
    report.restored.sort();

    tracing::info!(
        restored = report.restored.len(),
        missing = report.missing.len(),
        refused = report.refused.len(),
        "restore finished"
    );
    Ok(report)
}

/// Extract the regular-file members named in `members` to their targets.
/// Every named member must be present in the chunk.
fn extract_members(chunk: &Path, members: &BTreeMap<String, PathBuf>) -> Result<Vec<PathBuf>> {
    let archive_err = |e: std::io::Error| EngineError::Archive(format!("{}: {}", chunk.display(), e));

    let file = File::open(chunk).map_err(archive_err)?;
    let decoder = ZstdDecoder::new(BufReader::new(file)).map_err(archive_err)?;
    let mut archive = Archive::new(decoder);

    let mut pending: BTreeSet<&str> = members.keys().map(String::as_str).collect();
    let mut written = Vec::with_capacity(members.len());
    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path().map_err(archive_err)?.to_string_lossy().replace('\\', "/");
        let Some(target) = members.get(&name) else {
            continue;
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.set_preserve_mtime(true);
        entry.unpack(target).map_err(archive_err)?;
        pending.remove(name.as_str());
        written.push(target.clone());
    }

    if let Some(absent) = pending.first() {
        return Err(EngineError::Archive(format!(
            "{} is recorded in {} but not in the archive",
            absent,
            chunk.display()
        )));
    }
    Ok(written)
}

fn is_encrypted(chunk_name: &str) -> bool {
    Path::new(chunk_name).extension().is_some_and(|ext| ext == ENCRYPTED_EXTENSION)
}

/// A recorded path as a relative path that cannot leave the target.
fn confined_path(path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative)
    }
}
