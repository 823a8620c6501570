use thiserror::Error;

/// Main error type for merge-index operations
#[derive(Error, Debug)]
pub enum MergeIndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Buffer {0} is sealed - no further writes accepted")]
    BufferSealed(u64),

    #[error("Segment {name} is corrupt: {reason}")]
    SegmentCorrupt { name: String, reason: String },

    #[error("Buffer converter worker is dead")]
    ConverterDead,

    #[error("Store is closed")]
    StoreClosed,

    #[error("Compaction failed: {0}")]
    CompactionFailed(String),
}

/// Result type alias for merge-index operations
pub type Result<T> = std::result::Result<T, MergeIndexError>;

impl MergeIndexError {
    /// Check if this error is fatal to the whole store (vs. a single request)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MergeIndexError::ConverterDead | MergeIndexError::StoreClosed
        )
    }
}
