//! Per-query stream reader
//!
//! Each reader owns a snapshot of buffers and segments (lock-protected by
//! the coordinator until it reports back), merge-sorts across them and
//! delivers deduplicated `(value, props)` batches to the client. Because
//! sources are ordered newest-first and entries sort newest-first within a
//! `(key, value)` pair, the first entry seen for a value wins; everything
//! after it - older writes, replaced tombstones - is elided.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::Sender;
use tracing::debug;

use super::{Command, StreamMessage};
use crate::buffer::Buffer;
use crate::error::Result;
use crate::merge::{merge_entries, EntryIter};
use crate::segment::SegmentReader;
use crate::types::{Bytes, Filter, Key};

/// Postings per client message
pub(crate) const BATCH_SIZE: usize = 1000;

pub(crate) enum StreamJob {
    Key(Key),
    Range {
        index: Bytes,
        field: Bytes,
        start_term: Bytes,
        end_term: Bytes,
        size: Option<usize>,
    },
}

/// Ensures the end-of-stream sentinel and the coordinator notification
/// fire exactly once, on success, error and panic alike
struct StreamGuard {
    stream_id: u64,
    out: Sender<StreamMessage>,
    coordinator: Sender<Command>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let _ = self.out.send(StreamMessage::Done);
        let _ = self.coordinator.send(Command::StreamDone {
            stream_id: self.stream_id,
        });
    }
}

pub(crate) fn spawn(
    stream_id: u64,
    buffers: Vec<Arc<Buffer>>,
    segments: Vec<Arc<SegmentReader>>,
    job: StreamJob,
    filter: Option<Filter>,
    out: Sender<StreamMessage>,
    coordinator: Sender<Command>,
) {
    thread::spawn(move || {
        let _guard = StreamGuard {
            stream_id,
            out: out.clone(),
            coordinator,
        };
        let merged = merge_entries(build_sources(&buffers, &segments, &job));
        if let Err(e) = deliver(merged, filter.as_ref(), &out) {
            debug!(stream = stream_id, error = %e, "stream reader aborted");
        }
    });
}

/// One ordered source per snapshot member, newest first: buffers from the
/// head backwards, then segments in list order
fn build_sources(
    buffers: &[Arc<Buffer>],
    segments: &[Arc<SegmentReader>],
    job: &StreamJob,
) -> Vec<EntryIter> {
    let mut sources: Vec<EntryIter> = Vec::with_capacity(buffers.len() + segments.len());
    for buffer in buffers.iter().rev() {
        match job {
            StreamJob::Key(key) => sources.push(Box::new(buffer.iter_key(key).map(Ok))),
            StreamJob::Range {
                index,
                field,
                start_term,
                end_term,
                size,
            } => sources.push(Box::new(
                buffer
                    .iter_terms(index, field, start_term, end_term, *size)
                    .into_iter()
                    .flat_map(|(_, postings)| postings)
                    .map(Ok),
            )),
        }
    }
    for segment in segments {
        match job {
            StreamJob::Key(key) => sources.push(Arc::clone(segment).iter_key(key)),
            StreamJob::Range {
                index,
                field,
                start_term,
                end_term,
                size,
            } => sources.push(Box::new(
                Arc::clone(segment)
                    .iter_terms(index, field, start_term, end_term, *size)
                    .into_iter()
                    .flat_map(|(_, entries)| entries),
            )),
        }
    }
    sources
}

fn deliver(
    merged: EntryIter,
    filter: Option<&Filter>,
    out: &Sender<StreamMessage>,
) -> Result<()> {
    let mut last_value: Option<Bytes> = None;
    let mut batch: Vec<(Bytes, Bytes)> = Vec::with_capacity(BATCH_SIZE);

    for item in merged {
        let posting = item?;
        // The first entry for a value has the highest precedence; any
        // repeat is an older write or a superseded tombstone
        if last_value.as_ref() == Some(&posting.value) {
            continue;
        }
        match posting.props {
            None => last_value = Some(posting.value),
            Some(props) => {
                let keep = filter.map(|f| f(&posting.value, &props)).unwrap_or(true);
                if keep {
                    batch.push((posting.value.clone(), props));
                    if batch.len() >= BATCH_SIZE {
                        let full = std::mem::replace(&mut batch, Vec::with_capacity(BATCH_SIZE));
                        if out.send(StreamMessage::Batch(full)).is_err() {
                            // Client went away; the guard still sends Done
                            return Ok(());
                        }
                    }
                }
                last_value = Some(posting.value);
            }
        }
    }

    if !batch.is_empty() {
        let _ = out.send(StreamMessage::Batch(batch));
    }
    Ok(())
}
