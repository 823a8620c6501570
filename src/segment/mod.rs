//! Immutable on-disk sorted posting files
//!
//! A segment is a file pair under the store root:
//! - `segment.<id>.data`    crc-framed blocks of sorted postings
//! - `segment.<id>.offsets` per-key block table
//!
//! `<id>` is either the integer id of the buffer the segment was converted
//! from, or a hex digest for compaction outputs. Segments are written once
//! behind a deleteme flag, then reopened read-only; they never change.

mod format;
mod reader;
mod writer;

pub use format::{data_file, offsets_file, BlockRef};
pub use reader::SegmentReader;
pub use writer::SegmentWriter;
