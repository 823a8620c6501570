//! Segment compaction: candidate selection and the background merge task
//!
//! Selection prefers merging many small segments while leaving large,
//! already-compacted ones untouched: everything smaller than the mean
//! size (biased up by 1 KiB so a fresh, nearly-empty segment is always
//! eligible) is a candidate, capped at `max_compact_segments`. Fewer than
//! three candidates is not worth a pass.
//!
//! The merge itself reuses the read-path combinator, so it is strictly
//! order-preserving: tombstones and duplicates are kept and collapse only
//! at read time, which makes a failed or repeated compaction harmless.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::Sender;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::Command;
use crate::error::Result;
use crate::flags;
use crate::merge::merge_entries;
use crate::segment::{SegmentReader, SegmentWriter};

/// Bias added to the mean segment size when selecting candidates
const AVG_BIAS_BYTES: u64 = 1024;

/// Outcome of a compaction pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactSummary {
    /// Segments consumed by the merge
    pub segments_merged: usize,
    /// Total bytes of the consumed segments
    pub bytes_merged: u64,
}

impl CompactSummary {
    pub fn empty() -> Self {
        Self {
            segments_merged: 0,
            bytes_merged: 0,
        }
    }
}

/// Pick the segments worth merging; empty when a pass is not worthwhile
pub(crate) fn select_candidates(
    segments: &[Arc<SegmentReader>],
    max_compact_segments: usize,
) -> Vec<Arc<SegmentReader>> {
    if segments.is_empty() {
        return Vec::new();
    }
    let mut sorted: Vec<_> = segments.to_vec();
    sorted.sort_by_key(|s| s.filesize());

    let total: u64 = sorted.iter().map(|s| s.filesize()).sum();
    let avg = total / sorted.len() as u64 + AVG_BIAS_BYTES;

    let candidates: Vec<_> = sorted
        .into_iter()
        .filter(|s| s.filesize() < avg)
        .take(max_compact_segments)
        .collect();
    if candidates.len() <= 2 {
        Vec::new()
    } else {
        candidates
    }
}

/// Merge `candidates` into one new segment on a background thread and
/// report the outcome to the coordinator
pub(crate) fn spawn(
    root: PathBuf,
    candidates: Vec<Arc<SegmentReader>>,
    block_size: u64,
    coordinator: Sender<Command>,
) {
    thread::spawn(move || {
        let old_names: Vec<String> = candidates.iter().map(|s| s.name().to_string()).collect();
        let bytes: u64 = candidates.iter().map(|s| s.filesize()).sum();
        let name = output_name();
        debug!(new = %name, merging = old_names.len(), bytes, "compaction started");

        let result = (|| -> Result<u64> {
            flags::set_flag(&root, &name)?;
            let mut sources = Vec::with_capacity(candidates.len());
            for segment in &candidates {
                sources.push(segment.iter()?);
            }
            let writer = SegmentWriter::create(&root, &name, block_size)?;
            writer.write_all(merge_entries(sources))
        })();

        match result {
            Ok(entries) => {
                debug!(new = %name, entries, "compaction finished");
                let _ = coordinator.send(Command::CompactionDone {
                    new_name: name,
                    old_names,
                    bytes,
                });
            }
            Err(e) => {
                warn!(new = %name, error = %e, "compaction failed");
                let _ = coordinator.send(Command::CompactionFailed {
                    error: e.to_string(),
                });
            }
        }
    });
}

/// Name a compaction output: `segment.<hex digest(now ‖ nonce)>`
fn output_name() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let nonce: u64 = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(now.to_le_bytes());
    hasher.update(nonce.to_le_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("{}.{}", flags::SEGMENT_PREFIX, hex)
}
