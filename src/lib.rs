//! Log-structured merge-index: a persistent, append-optimized
//! inverted-index store mapping `(index, field, term)` keys to streams of
//! `(value, timestamp, props)` postings.
//!
//! Writes land in an in-memory buffer backed by an append-only log; full
//! buffers are sealed and converted to immutable sorted segments in the
//! background, and small segments are continuously compacted into larger
//! ones. Reads merge-sort across a locked snapshot of all live sources
//! and deduplicate by value, newest write first.

pub mod buffer;
pub mod config;
pub mod error;
pub mod flags;
pub mod locks;
pub mod merge;
pub mod segment;
pub mod store;
pub mod types;

pub use config::StoreConfig;
pub use error::{MergeIndexError, Result};
pub use store::{CompactSummary, Store, StoreStatus, StreamMessage};
pub use types::{Bytes, Filter, Key, Posting};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
