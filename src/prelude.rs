pub use crate::ball::{create_ball, Ball};
pub use crate::config::BallConfig;
pub use crate::ds::GhostList;
pub use crate::error::{Error, Result};
pub use crate::policy::ArcCache;
pub use crate::stats::{Statistics, StatsSnapshot};
pub use crate::store::{LsmStore, OpenOptions, PageStore, StoreError};
pub use crate::PageId;
