//! Persistent store adapter.
//!
//! The cache core needs very little from its backing store: open a
//! directory, point-lookup a page, write a page, merge on request,
//! close. [`PageStore`] is that capability set; [`LsmStore`] is the
//! bundled log-structured implementation with LZ4 block compression.
//! Callers never see compressed bytes on either side of the trait.

pub mod lsm;

pub use lsm::LsmStore;

use thiserror::Error;

/// Key type: a page id, or a synthetic id carrying a prefix bit.
pub type StoreKey = u64;

/// Prefix bit for large-object payload records.
pub const LARGE_DATA_PREFIX: StoreKey = 1 << 63;

/// Prefix bit for large-object auxiliary length records.
pub const LARGE_LEN_PREFIX: StoreKey = 1 << 62;

/// Failures reported by a [`PageStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested directory (or record) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An I/O failure from the platform.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record failed framing or decompression checks.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Flags honoured by [`LsmStore::open`].
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Create the directory when it does not exist.
    pub create_if_missing: bool,
    /// Fail when the directory already holds a store.
    pub error_if_exists: bool,
    /// Wipe any existing store before opening.
    pub overwrite: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            overwrite: false,
        }
    }
}

/// The narrow capability set the cache core consumes.
///
/// Implementations must be safe to share across the caller threads and
/// the background worker. Point lookups are the hot operation.
pub trait PageStore: Send + Sync {
    /// Fetches the value stored under `key`, if any.
    fn get(&self, key: StoreKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: StoreKey, value: &[u8]) -> Result<(), StoreError>;

    /// Merges on-disk state; a hint, not a correctness requirement.
    fn compact(&self) -> Result<(), StoreError>;

    /// Flushes buffered state and refuses further operations.
    fn close(&self) -> Result<(), StoreError>;
}
