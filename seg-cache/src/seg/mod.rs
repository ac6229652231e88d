//! Segment heap and per-segment metadata

pub mod header;
pub mod heap;

pub use header::SegmentHeader;
pub use heap::{HeapLists, SegHeap};
