pub mod frame;

pub use frame::{Frame, FrameTable};
