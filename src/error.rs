//! Error types for the pagekit library.
//!
//! A single [`Error`] enum covers every fallible surface: allocation,
//! the persistent store, configuration validation, capacity exhaustion,
//! and teardown races. Store-level failures carry their own
//! [`StoreError`](crate::store::StoreError) and convert via `?`.

use thiserror::Error;

use crate::store::StoreError;

/// Unified error type for all pagekit operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The platform allocator refused a request of the given size.
    #[error("out of memory: failed to allocate {0} bytes")]
    OutOfMemory(usize),

    /// A failure reported by the persistent store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A configuration or call-site parameter failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The capacity limit is reached and no resident entry owns an
    /// evictable frame.
    #[error("capacity exhausted: no evictable frame available")]
    Exhausted,

    /// The ball (or the process-wide worker) is shutting down and no
    /// longer accepts work.
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

/// Result alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::OutOfMemory(4096);
        assert!(err.to_string().contains("4096"));

        let err = Error::InvalidArgument("page_size must be a power of two".into());
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn store_error_converts() {
        fn open() -> Result<()> {
            Err(StoreError::NotFound("missing directory".into()))?;
            Ok(())
        }
        assert!(matches!(open(), Err(Error::Store(StoreError::NotFound(_)))));
    }

    #[test]
    fn implements_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<Error>();
    }
}
