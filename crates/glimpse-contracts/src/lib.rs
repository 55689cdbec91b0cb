pub mod geometry;
pub mod memory;
pub mod trace;

pub use geometry::{MatchResult, Point, Rect, SearchRegion, Size};
