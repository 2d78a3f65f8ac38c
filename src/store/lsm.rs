//! Log-structured page store with LZ4 block compression.
//!
//! Writes land in a write-ahead log and an in-memory memtable; when the
//! memtable grows past a threshold it is flushed into an immutable,
//! sorted segment file. Reads consult the memtable first, then segments
//! newest to oldest through per-segment point-lookup indexes. `compact`
//! merges every segment (newest record wins) into one.
//!
//! Record framing, identical in the WAL and in segments:
//!
//! ```text
//! ┌────────────┬──────────────┬─────────────────────────┐
//! │ key: u64 LE│ len: u32 LE  │ LZ4 block (len bytes)   │
//! └────────────┴──────────────┴─────────────────────────┘
//! ```
//!
//! Values are compressed on `put` and decompressed on `get`; callers
//! only ever see raw page bytes.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions as FsOpenOptions};
use std::io::{BufWriter, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::store::{OpenOptions, PageStore, StoreError, StoreKey};

/// Memtable flush threshold (compressed bytes).
const MEMTABLE_FLUSH_BYTES: usize = 256 * 1024;

const WAL_NAME: &str = "wal.log";
const SEGMENT_EXT: &str = "seg";

const RECORD_HEADER: usize = 8 + 4;

/// One immutable segment file plus its point-lookup index.
struct Segment {
    file: File,
    path: PathBuf,
    /// key → (offset of the compressed block, compressed length)
    index: FxHashMap<StoreKey, (u64, u32)>,
}

struct Inner {
    /// Compressed values, sorted by key for segment writes.
    memtable: BTreeMap<StoreKey, Vec<u8>>,
    mem_bytes: usize,
    wal: BufWriter<File>,
    /// Oldest first.
    segments: Vec<Segment>,
    next_segment: u64,
    closed: bool,
}

/// Log-structured [`PageStore`] bound to one directory.
pub struct LsmStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl LsmStore {
    /// Opens (or creates) a store in `dir` according to `options`.
    ///
    /// Existing segments are re-indexed and the WAL is replayed into the
    /// memtable, so every acknowledged `put` survives reopen.
    pub fn open(dir: impl AsRef<Path>, options: OpenOptions) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();

        if dir.exists() {
            if options.error_if_exists {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("store already exists at {}", dir.display()),
                )));
            }
            if options.overwrite {
                fs::remove_dir_all(&dir)?;
                fs::create_dir_all(&dir)?;
            }
        } else if options.create_if_missing {
            fs::create_dir_all(&dir)?;
        } else {
            return Err(StoreError::NotFound(format!(
                "no store at {}",
                dir.display()
            )));
        }

        let mut segment_paths: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXT) {
                if let Some(seq) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    segment_paths.push((seq, path));
                }
            }
        }
        segment_paths.sort_by_key(|(seq, _)| *seq);

        let mut segments = Vec::with_capacity(segment_paths.len());
        for (_, path) in &segment_paths {
            segments.push(Segment::load(path)?);
        }
        let next_segment = segment_paths.last().map_or(0, |(seq, _)| seq + 1);

        let wal_path = dir.join(WAL_NAME);
        let (memtable, mem_bytes) = if wal_path.exists() {
            replay_wal(&wal_path)?
        } else {
            (BTreeMap::new(), 0)
        };
        let wal_file = FsOpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)?;

        tracing::info!(
            dir = %dir.display(),
            segments = segments.len(),
            replayed = memtable.len(),
            "opened store"
        );

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                memtable,
                mem_bytes,
                wal: BufWriter::new(wal_file),
                segments,
                next_segment,
                closed: false,
            }),
        })
    }

    /// Directory this store is bound to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn flush_memtable(&self, inner: &mut Inner) -> Result<(), StoreError> {
        if inner.memtable.is_empty() {
            return Ok(());
        }

        let seq = inner.next_segment;
        let path = self.dir.join(format!("{seq:06}.{SEGMENT_EXT}"));
        let file = FsOpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)?;
        let mut writer = BufWriter::new(&file);
        let mut index = FxHashMap::default();
        let mut offset = 0u64;

        for (&key, block) in &inner.memtable {
            writer.write_all(&key.to_le_bytes())?;
            writer.write_all(&(block.len() as u32).to_le_bytes())?;
            writer.write_all(block)?;
            index.insert(key, (offset + RECORD_HEADER as u64, block.len() as u32));
            offset += (RECORD_HEADER + block.len()) as u64;
        }
        writer.flush()?;
        drop(writer);
        file.sync_all()?;

        inner.segments.push(Segment { file, path, index });
        inner.next_segment = seq + 1;
        inner.memtable.clear();
        inner.mem_bytes = 0;

        // The WAL's contents are now durable in the segment.
        let wal_path = self.dir.join(WAL_NAME);
        let truncated = FsOpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&wal_path)?;
        inner.wal = BufWriter::new(truncated);

        tracing::debug!(segment = seq, "flushed memtable");
        Ok(())
    }

    fn check_open(inner: &Inner) -> Result<(), StoreError> {
        if inner.closed {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "store is closed",
            )));
        }
        Ok(())
    }
}

impl PageStore for LsmStore {
    fn get(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock();
        Self::check_open(&inner)?;

        if let Some(block) = inner.memtable.get(&key) {
            return decompress(block).map(Some);
        }
        for segment in inner.segments.iter().rev() {
            if let Some(&(offset, len)) = segment.index.get(&key) {
                let mut block = vec![0u8; len as usize];
                segment.file.read_exact_at(&mut block, offset)?;
                return decompress(&block).map(Some);
            }
        }
        Ok(None)
    }

    fn put(&self, key: StoreKey, value: &[u8]) -> Result<(), StoreError> {
        let block = compress_prepend_size(value);

        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;

        inner.wal.write_all(&key.to_le_bytes())?;
        inner.wal.write_all(&(block.len() as u32).to_le_bytes())?;
        inner.wal.write_all(&block)?;
        inner.wal.flush()?;

        inner.mem_bytes += block.len();
        inner.memtable.insert(key, block);

        if inner.mem_bytes >= MEMTABLE_FLUSH_BYTES {
            self.flush_memtable(&mut inner)?;
        }
        Ok(())
    }

    fn compact(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        self.flush_memtable(&mut inner)?;

        if inner.segments.len() <= 1 {
            return Ok(());
        }

        // Newest record wins; compressed blocks are copied verbatim.
        let mut merged: BTreeMap<StoreKey, Vec<u8>> = BTreeMap::new();
        for segment in &inner.segments {
            for (&key, &(offset, len)) in &segment.index {
                let mut block = vec![0u8; len as usize];
                segment.file.read_exact_at(&mut block, offset)?;
                merged.insert(key, block);
            }
        }

        let old: Vec<PathBuf> = inner.segments.iter().map(|s| s.path.clone()).collect();
        let count = merged.len();
        inner.memtable = merged;
        inner.mem_bytes = 0;
        inner.segments.clear();
        self.flush_memtable(&mut inner)?;
        for path in old {
            fs::remove_file(&path)?;
        }
        tracing::info!(records = count, "compacted store");
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        self.flush_memtable(&mut inner)?;
        inner.wal.flush()?;
        inner.closed = true;
        tracing::info!(dir = %self.dir.display(), "closed store");
        Ok(())
    }
}

impl Drop for LsmStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(%err, "store close on drop failed");
        }
    }
}

impl Segment {
    /// Re-indexes a segment file by scanning its records.
    fn load(path: &Path) -> Result<Self, StoreError> {
        let mut file = File::open(path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut index = FxHashMap::default();
        let mut cursor = 0usize;
        while cursor < raw.len() {
            if cursor + RECORD_HEADER > raw.len() {
                return Err(StoreError::Corrupt(format!(
                    "truncated record header in {}",
                    path.display()
                )));
            }
            let key = u64::from_le_bytes(raw[cursor..cursor + 8].try_into().unwrap());
            let len =
                u32::from_le_bytes(raw[cursor + 8..cursor + RECORD_HEADER].try_into().unwrap());
            let payload = cursor + RECORD_HEADER;
            if payload + len as usize > raw.len() {
                return Err(StoreError::Corrupt(format!(
                    "truncated record body in {}",
                    path.display()
                )));
            }
            index.insert(key, (payload as u64, len));
            cursor = payload + len as usize;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            index,
        })
    }
}

fn decompress(block: &[u8]) -> Result<Vec<u8>, StoreError> {
    decompress_size_prepended(block)
        .map_err(|err| StoreError::Corrupt(format!("lz4 decompression failed: {err}")))
}

/// Rebuilds the memtable from WAL records; a trailing partial record
/// (torn write) is ignored.
fn replay_wal(path: &Path) -> Result<(BTreeMap<StoreKey, Vec<u8>>, usize), StoreError> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;

    let mut memtable = BTreeMap::new();
    let mut bytes = 0usize;
    let mut cursor = 0usize;
    while cursor + RECORD_HEADER <= raw.len() {
        let key = u64::from_le_bytes(raw[cursor..cursor + 8].try_into().unwrap());
        let len =
            u32::from_le_bytes(raw[cursor + 8..cursor + RECORD_HEADER].try_into().unwrap()) as usize;
        let payload = cursor + RECORD_HEADER;
        if payload + len > raw.len() {
            break;
        }
        let block = raw[payload..payload + len].to_vec();
        bytes += block.len();
        memtable.insert(key, block);
        cursor = payload + len;
    }
    Ok((memtable, bytes))
}
