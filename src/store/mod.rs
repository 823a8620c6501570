//! The store: public handle plus the single-writer coordinator behind it
//!
//! All state mutation happens on one coordinator thread that drains a
//! command channel; the public `Store` is a cheap clonable sender. The
//! buffer converter, the compactor and every stream reader run as
//! independent threads that report back with internal commands.

mod compactor;
mod converter;
mod coordinator;
mod stream;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, unbounded, Sender};
use tracing::info;

use crate::buffer::Buffer;
use crate::config::StoreConfig;
use crate::error::{MergeIndexError, Result};
use crate::flags::{self, FileId};
use crate::segment::SegmentReader;
use crate::types::{Bytes, Filter, Key, Posting};

pub use compactor::CompactSummary;

/// Messages delivered to a stream receiver: zero or more batches of
/// `(value, props)` pairs followed by the end-of-stream sentinel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamMessage {
    Batch(Vec<(Bytes, Bytes)>),
    Done,
}

/// Point-in-time operational counters
#[derive(Clone, Debug)]
pub struct StoreStatus {
    pub buffer_count: usize,
    pub segment_count: usize,
    pub segment_bytes: u64,
    pub compacting: bool,
}

pub(crate) enum Command {
    Index {
        postings: Vec<Posting>,
        reply: Sender<Result<()>>,
    },
    Info {
        key: Key,
        reply: Sender<Result<u64>>,
    },
    Stream {
        key: Key,
        filter: Option<Filter>,
        out: Sender<StreamMessage>,
        reply: Sender<Result<()>>,
    },
    Range {
        index: Bytes,
        field: Bytes,
        start_term: Bytes,
        end_term: Bytes,
        size: Option<usize>,
        filter: Option<Filter>,
        out: Sender<StreamMessage>,
        reply: Sender<Result<()>>,
    },
    Fold {
        out: Sender<Posting>,
        reply: Sender<Result<()>>,
    },
    IsEmpty {
        reply: Sender<Result<bool>>,
    },
    Status {
        reply: Sender<Result<StoreStatus>>,
    },
    DropAll {
        reply: Sender<Result<()>>,
    },
    Compact {
        reply: Sender<Result<CompactSummary>>,
    },
    // Internal messages from background workers
    ConvertDone {
        buffer: Arc<Buffer>,
        segment_name: String,
    },
    ConvertFailed {
        buffer_id: u64,
        error: String,
    },
    CompactionDone {
        new_name: String,
        old_names: Vec<String>,
        bytes: u64,
    },
    CompactionFailed {
        error: String,
    },
    StreamDone {
        stream_id: u64,
    },
    Shutdown,
}

/// Handle to a running merge-index store
///
/// Clones share one coordinator; dropping the last clone shuts the store
/// down (the head buffer log is flushed and closed on the way out).
#[derive(Clone)]
pub struct Store {
    tx: Sender<Command>,
    _shutdown: Arc<ShutdownGuard>,
}

struct ShutdownGuard {
    tx: Sender<Command>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

impl Store {
    /// Open a store rooted at `root`, running the startup sweep and
    /// re-queueing any leftover sealed buffers for conversion
    pub fn open(root: impl AsRef<Path>, config: StoreConfig) -> Result<Store> {
        let root: PathBuf = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let swept = flags::sweep(&root)?;
        if swept > 0 {
            info!(swept, root = %root.display(), "startup sweep removed flagged files");
        }

        // Open every remaining segment, newest first
        let names = flags::list_root(&root)?;
        let mut segments: Vec<Arc<SegmentReader>> = Vec::new();
        for name in &names {
            if name.starts_with(flags::SEGMENT_PREFIX)
                && name.ends_with(&format!(".{}", flags::DATA_SUFFIX))
            {
                let base = flags::base_name(name);
                segments.push(Arc::new(SegmentReader::open(&root, base)?));
            }
        }
        segments.sort_by(|a, b| segment_recency(b.name()).cmp(&segment_recency(a.name())));

        // Enumerate buffers ascending by id; the last one becomes the head
        let mut buffer_ids: Vec<u64> = names
            .iter()
            .filter(|n| n.starts_with(flags::BUFFER_PREFIX))
            .filter_map(|n| match flags::parse_id(n) {
                Some(FileId::Scalar(id)) => Some(id),
                _ => None,
            })
            .collect();
        buffer_ids.sort_unstable();

        let max_seg_id = segments
            .iter()
            .filter_map(|s| flags::parse_id(s.name()))
            .map(|id| id.max_id())
            .max()
            .unwrap_or(0);

        let mut buffers: Vec<Arc<Buffer>> = Vec::new();
        for &id in &buffer_ids {
            buffers.push(Arc::new(Buffer::open(
                root.join(format!("{}.{}", flags::BUFFER_PREFIX, id)),
                id,
            )?));
        }
        if buffers.is_empty() {
            let id = max_seg_id + 1;
            buffers.push(Arc::new(Buffer::open(
                root.join(format!("{}.{}", flags::BUFFER_PREFIX, id)),
                id,
            )?));
        }
        let head_id = buffers.last().expect("head buffer").id();
        let next_id = head_id.max(max_seg_id) + 1;

        // Seal everything but the head and hand it to the converter
        let (cmd_tx, cmd_rx) = unbounded();
        let (convert_tx, convert_rx) = unbounded();
        converter::spawn(
            convert_rx,
            cmd_tx.clone(),
            root.clone(),
            config.segment_block_size,
        );
        for buffer in &buffers[..buffers.len() - 1] {
            buffer.close_filehandle()?;
            convert_tx
                .send(converter::ConvertTask {
                    buffer: Arc::clone(buffer),
                })
                .map_err(|_| MergeIndexError::ConverterDead)?;
        }

        info!(
            root = %root.display(),
            buffers = buffers.len(),
            segments = segments.len(),
            head = head_id,
            "store opened"
        );

        let coordinator = coordinator::Coordinator::new(
            root,
            config,
            buffers,
            segments,
            next_id,
            convert_tx,
            cmd_tx.clone(),
        );
        thread::spawn(move || coordinator.run(cmd_rx));

        Ok(Store {
            tx: cmd_tx.clone(),
            _shutdown: Arc::new(ShutdownGuard { tx: cmd_tx }),
        })
    }

    /// Append a batch of postings to the head buffer
    pub fn index(&self, postings: Vec<Posting>) -> Result<()> {
        self.call(|reply| Command::Index { postings, reply })
    }

    /// Summed selectivity estimate for a term: buffer counts plus segment
    /// block weights (a heterogeneous scalar, useful only as an estimate)
    pub fn info(
        &self,
        index: impl Into<Bytes>,
        field: impl Into<Bytes>,
        term: impl Into<Bytes>,
    ) -> Result<u64> {
        let key = Key::new(index, field, term);
        self.call(|reply| Command::Info { key, reply })
    }

    /// Stream the deduplicated postings for one term. Batches of up to
    /// 1000 `(value, props)` pairs arrive on the returned receiver,
    /// terminated by `StreamMessage::Done`.
    pub fn stream(
        &self,
        index: impl Into<Bytes>,
        field: impl Into<Bytes>,
        term: impl Into<Bytes>,
        filter: Option<Filter>,
    ) -> Result<crossbeam::channel::Receiver<StreamMessage>> {
        let (out, rx) = unbounded();
        self.stream_to(index, field, term, filter, out)?;
        Ok(rx)
    }

    /// Like [`Store::stream`] but delivering to a caller-supplied channel.
    /// A slow consumer on a bounded channel backpressures the reader; the
    /// snapshot's files stay locked until the reader exits.
    pub fn stream_to(
        &self,
        index: impl Into<Bytes>,
        field: impl Into<Bytes>,
        term: impl Into<Bytes>,
        filter: Option<Filter>,
        out: Sender<StreamMessage>,
    ) -> Result<()> {
        let key = Key::new(index, field, term);
        self.call(|reply| Command::Stream {
            key,
            filter,
            out,
            reply,
        })
    }

    /// Stream every term in `[start_term, end_term]`; `size` bounds the
    /// number of terms drawn from each source
    pub fn range(
        &self,
        index: impl Into<Bytes>,
        field: impl Into<Bytes>,
        start_term: impl Into<Bytes>,
        end_term: impl Into<Bytes>,
        size: Option<usize>,
        filter: Option<Filter>,
    ) -> Result<crossbeam::channel::Receiver<StreamMessage>> {
        let (out, rx) = unbounded();
        self.range_to(index, field, start_term, end_term, size, filter, out)?;
        Ok(rx)
    }

    /// Like [`Store::range`] but delivering to a caller-supplied channel
    #[allow(clippy::too_many_arguments)]
    pub fn range_to(
        &self,
        index: impl Into<Bytes>,
        field: impl Into<Bytes>,
        start_term: impl Into<Bytes>,
        end_term: impl Into<Bytes>,
        size: Option<usize>,
        filter: Option<Filter>,
        out: Sender<StreamMessage>,
    ) -> Result<()> {
        self.call(|reply| Command::Range {
            index: index.into(),
            field: field.into(),
            start_term: start_term.into(),
            end_term: end_term.into(),
            size,
            filter,
            out,
            reply,
        })
    }

    /// Fold over every posting in every buffer and segment, without
    /// deduplication. Blocks the coordinator for the duration; intended
    /// for administrative traversal only.
    pub fn fold<A, F>(&self, init: A, mut f: F) -> Result<A>
    where
        F: FnMut(A, Posting) -> A,
    {
        let (out, postings) = unbounded();
        let (reply, reply_rx) = bounded(1);
        self.tx
            .send(Command::Fold { out, reply })
            .map_err(|_| MergeIndexError::StoreClosed)?;
        let mut acc = init;
        for posting in postings {
            acc = f(acc, posting);
        }
        reply_rx.recv().map_err(|_| MergeIndexError::StoreClosed)??;
        Ok(acc)
    }

    /// True iff all buffers are empty and no segments exist
    pub fn is_empty(&self) -> Result<bool> {
        self.call(|reply| Command::IsEmpty { reply })
    }

    /// Operational counters
    pub fn status(&self) -> Result<StoreStatus> {
        self.call(|reply| Command::Status { reply })
    }

    /// Delete every buffer and segment and reset to a single empty head
    /// buffer with id 1. Invalidates any in-flight streams.
    pub fn drop_all(&self) -> Result<()> {
        self.call(|reply| Command::DropAll { reply })
    }

    /// Run a compaction pass and return how many segments were merged
    /// and their total byte size. If a pass is already in flight the
    /// call joins it and blocks until that pass's real result is known;
    /// a zero summary means there was nothing worth merging.
    pub fn compact(&self) -> Result<CompactSummary> {
        self.call(|reply| Command::Compact { reply })
    }

    fn call<T>(&self, make: impl FnOnce(Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(make(reply))
            .map_err(|_| MergeIndexError::StoreClosed)?;
        rx.recv().map_err(|_| MergeIndexError::StoreClosed)?
    }
}

/// Startup ordering: integer-id segments are newer than hex compaction
/// outputs, and higher ids are newer still
fn segment_recency(name: &str) -> (u8, u64, String) {
    match flags::parse_id(name) {
        Some(id) => (1, id.max_id(), String::new()),
        None => (0, 0, name.to_string()),
    }
}
