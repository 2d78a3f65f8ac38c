//! pagekit: an embedded, persistent, page-granular cache.
//!
//! A [`Ball`](ball::Ball) binds a directory on disk to a bounded set of
//! fixed-size in-memory frames. Reads and writes address the cache
//! through virtual addresses; an adaptive replacement engine decides
//! which pages stay resident, cold pages are compressed into a
//! log-structured store, and a single background worker absorbs the
//! disk I/O.
//!
//! See `DESIGN.md` for internal architecture and invariants.

pub mod ball;
pub mod config;
pub mod ds;
pub mod error;
pub mod mem;
pub mod paging;
pub mod policy;
pub mod prelude;
pub mod stats;
pub mod store;

mod runtime;

pub use runtime::open_ball_count;

/// A page identifier: `floor(virtual_address / page_size)`.
pub type PageId = u64;

pub use ball::{create_ball, Ball};
pub use config::BallConfig;
pub use error::{Error, Result};
