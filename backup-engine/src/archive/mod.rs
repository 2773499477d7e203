//! Chunked `tar.zst` archives.
//!
//! Packing and listing are independent: a closed chunk is listed by
//! re-reading it from disk, never from state left over by the writer.

pub mod chunk;

pub use chunk::{chunk_name, ChunkWriter, CHUNK_EXTENSION, DEFAULT_COMPRESSION_LEVEL};

use crate::utils::{EngineError, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tar::Archive;
use zstd::stream::read::Decoder as ZstdDecoder;

/// One member of a chunk as recorded in its tar header.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEntry {
    pub path: String,
    pub size: u64,
    pub mtime: f64,
}

/// Read back the regular-file members of a closed chunk.
pub fn list_chunk(path: &Path) -> Result<Vec<ChunkEntry>> {
    let archive_err = |e: std::io::Error| EngineError::Archive(format!("{}: {}", path.display(), e));

    let file = File::open(path).map_err(archive_err)?;
    let decoder = ZstdDecoder::new(BufReader::new(file)).map_err(archive_err)?;
    let mut archive = Archive::new(decoder);

    let mut entries = Vec::new();
    for entry in archive.entries().map_err(archive_err)? {
        let entry = entry.map_err(archive_err)?;
        let header = entry.header();
        if !header.entry_type().is_file() {
            continue;
        }
        entries.push(ChunkEntry {
            path: entry.path().map_err(archive_err)?.to_string_lossy().replace('\\', "/"),
            size: header.size().map_err(archive_err)?,
            mtime: header.mtime().map_err(archive_err)? as f64,
        });
    }
    Ok(entries)
}
