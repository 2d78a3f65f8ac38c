pub mod arc;

pub use arc::{ArcCache, EvictionHook};
