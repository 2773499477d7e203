use crate::fs::relative_slash_path;
use crate::utils::{EngineError, Result};
use chrono::Local;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tar::{Builder as TarBuilder, Header};
use zstd::stream::write::Encoder as ZstdEncoder;

/// zstd level used for every chunk.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

pub const CHUNK_EXTENSION: &str = "tar.zst";

/// Files up to this size are staged in memory, larger ones in a scratch
/// file next to the chunks.
const IN_MEMORY_STAGE_BYTES: u64 = 8 * 1024 * 1024;

const SCRATCH_NAME: &str = ".staging";

type ChunkStream = TarBuilder<ZstdEncoder<'static, BufWriter<File>>>;

/// One chunk being written.
struct OpenChunk {
    path: PathBuf,
    tar: ChunkStream,
    bytes: u64,
    entries: usize,
}

impl OpenChunk {
    fn create(path: PathBuf, level: i32) -> Result<Self> {
        let file = File::create(&path)?;
        let encoder = ZstdEncoder::new(BufWriter::new(file), level)?;
        let tar = TarBuilder::new(encoder);
        Ok(Self {
            path,
            tar,
            bytes: 0,
            entries: 0,
        })
    }

    fn close(self) -> Result<PathBuf> {
        let encoder = self.tar.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| EngineError::Archive(format!("{}: {}", self.path.display(), e)))?;
        file.sync_all()?;
        Ok(self.path)
    }
}

/// A source file read in full before any byte of it reaches a chunk, so a
/// read error cannot leave a truncated member in the archive.
struct StagedFile {
    header: Header,
    data: StagedData,
}

enum StagedData {
    Memory(Vec<u8>),
    Scratch(File),
}

impl StagedFile {
    fn read(path: &Path, scratch: &Path) -> io::Result<Self> {
        let mut source = File::open(path)?;
        let metadata = source.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        }

        let (data, size) = if metadata.len() <= IN_MEMORY_STAGE_BYTES {
            let mut buf = Vec::with_capacity(metadata.len() as usize);
            source.read_to_end(&mut buf)?;
            let size = buf.len() as u64;
            (StagedData::Memory(buf), size)
        } else {
            let mut file = open_scratch(scratch)?;
            let size = io::copy(&mut source, &mut file)?;
            file.seek(SeekFrom::Start(0))?;
            (StagedData::Scratch(file), size)
        };

        let mut header = Header::new_gnu();
        header.set_metadata(&metadata);
        header.set_size(size);
        Ok(Self { header, data })
    }

    fn size(&self) -> u64 {
        self.header.size().unwrap_or(0)
    }

    fn append_to(mut self, tar: &mut ChunkStream, name: &str) -> io::Result<()> {
        match &mut self.data {
            StagedData::Memory(buf) => tar.append_data(&mut self.header, name, buf.as_slice()),
            StagedData::Scratch(file) => tar.append_data(&mut self.header, name, file),
        }
    }
}

/// Removes a scratch file however the work using it ends.
pub(crate) struct Scratch(pub(crate) PathBuf);

impl Drop for Scratch {
    fn drop(&mut self) {
        match fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.0.display(), error = %e, "failed to remove staging file"),
        }
    }
}

fn open_scratch(path: &Path) -> io::Result<File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Packs files into size-bounded `tar.zst` chunks.
#[derive(Debug, Clone)]
pub struct ChunkWriter {
    level: i32,
}

impl Default for ChunkWriter {
    fn default() -> Self {
        Self {
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(level: i32) -> Self {
        Self { level }
    }

    /// Write `files` into `<kind_label>_part_<n>_<timestamp>.tar.zst` chunks
    /// under `dest_dir`, in input order.
    ///
    /// A new chunk starts when the next file would push the current one past
    /// `max_chunk_bytes` and the current one already holds something, so a
    /// single file larger than the limit gets a chunk of its own. Sizes are
    /// content sizes; tar and compression overhead is not counted. No file
    /// means no chunk. A file that cannot be read in full is left out
    /// before its header is written.
    pub fn pack(
        &self,
        files: &[PathBuf],
        source_root: &Path,
        dest_dir: &Path,
        max_chunk_bytes: u64,
        kind_label: &str,
    ) -> Result<Vec<PathBuf>> {
        if !source_root.is_dir() {
            return Err(EngineError::SourceUnreadable(source_root.display().to_string()));
        }
        fs::create_dir_all(dest_dir)?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let base = taken_ordinals(dest_dir, kind_label, &stamp);
        let scratch = Scratch(dest_dir.join(SCRATCH_NAME));
        let mut closed = Vec::new();
        let mut current: Option<OpenChunk> = None;

        for path in files {
            let Some(name) = relative_slash_path(path, source_root) else {
                tracing::warn!(path = %path.display(), "skipping file with a non-UTF-8 name");
                continue;
            };
            let staged = match StagedFile::read(path, &scratch.0) {
                Ok(staged) => staged,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping file that vanished or could not be read");
                    continue;
                }
            };
            let size = staged.size();

            let mut chunk = match current.take() {
                Some(full) if full.entries > 0 && full.bytes + size > max_chunk_bytes => {
                    closed.push(full.close()?);
                    self.open(dest_dir, kind_label, base + closed.len() + 1, &stamp)?
                }
                Some(chunk) => chunk,
                None => self.open(dest_dir, kind_label, base + closed.len() + 1, &stamp)?,
            };

            // staged data is already in hand, so a failure here is the chunk's own
            staged
                .append_to(&mut chunk.tar, &name)
                .map_err(|e| EngineError::Archive(format!("{}: {}", chunk.path.display(), e)))?;
            chunk.bytes += size;
            chunk.entries += 1;
            current = Some(chunk);
        }

        if let Some(chunk) = current {
            closed.push(chunk.close()?);
        }

        tracing::debug!(chunks = closed.len(), files = files.len(), kind = kind_label, "packing finished");
        Ok(closed)
    }

    fn open(&self, dest_dir: &Path, kind_label: &str, ordinal: usize, stamp: &str) -> Result<OpenChunk> {
        let path = dest_dir.join(chunk_name(kind_label, ordinal, stamp));
        tracing::debug!(chunk = %path.display(), "opening chunk");
        OpenChunk::create(path, self.level)
    }
}

/// Number of leading ordinals already used at `stamp` by an earlier run
/// writing into the same directory, encrypted or not.
fn taken_ordinals(dest_dir: &Path, kind_label: &str, stamp: &str) -> usize {
    let mut taken = 0;
    loop {
        let name = chunk_name(kind_label, taken + 1, stamp);
        if dest_dir.join(&name).exists() || dest_dir.join(format!("{}.gpg", name)).exists() {
            taken += 1;
        } else {
            return taken;
        }
    }
}

pub fn chunk_name(kind_label: &str, ordinal: usize, stamp: &str) -> String {
    format!("{}_part_{}_{}.{}", kind_label, ordinal, stamp, CHUNK_EXTENSION)
}
