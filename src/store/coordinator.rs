//! Single-writer coordinator state machine
//!
//! One message at a time: every mutation of the buffer list, segment
//! list, lock registry and compaction slot happens here. Background
//! workers hand their results back as internal commands; stream readers
//! get a locked snapshot and report exit so their claims can be released.
//!
//! Invariants maintained:
//! - the head buffer is the last element of the buffer list; all earlier
//!   buffers are sealed
//! - a file in a visible list never carries a deleteme flag; the flag is
//!   set before removal from the list and cleared before insertion
//! - buffer ids increase strictly over the store's lifetime

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::compactor::{self, CompactSummary};
use super::converter::ConvertTask;
use super::stream::{self, StreamJob};
use super::{Command, StoreStatus, StreamMessage};
use crate::buffer::Buffer;
use crate::config::StoreConfig;
use crate::error::{MergeIndexError, Result};
use crate::flags;
use crate::locks::Locks;
use crate::segment::SegmentReader;
use crate::types::{Filter, Key, Posting};

struct PendingCompaction {
    /// Clients waiting on `compact()`, all replied to when the pass
    /// finishes; empty for passes the coordinator scheduled itself
    requesters: Vec<Sender<Result<CompactSummary>>>,
}

struct StreamSnapshot {
    names: Vec<String>,
}

pub(crate) struct Coordinator {
    root: PathBuf,
    config: StoreConfig,
    locks: Locks,
    /// Head last; everything before it is sealed
    buffers: Vec<Arc<Buffer>>,
    /// Newest first
    segments: Vec<Arc<SegmentReader>>,
    next_id: u64,
    rollover_size: u64,
    compacting: Option<PendingCompaction>,
    convert_tx: Sender<ConvertTask>,
    self_tx: Sender<Command>,
    streams: HashMap<u64, StreamSnapshot>,
    next_stream_id: u64,
}

impl Coordinator {
    pub(crate) fn new(
        root: PathBuf,
        config: StoreConfig,
        buffers: Vec<Arc<Buffer>>,
        segments: Vec<Arc<SegmentReader>>,
        next_id: u64,
        convert_tx: Sender<ConvertTask>,
        self_tx: Sender<Command>,
    ) -> Self {
        let rollover_size = config.fuzzed_rollover_size(&mut rand::thread_rng());
        Self {
            root,
            config,
            locks: Locks::new(),
            buffers,
            segments,
            next_id,
            rollover_size,
            compacting: None,
            convert_tx,
            self_tx,
            streams: HashMap::new(),
            next_stream_id: 1,
        }
    }

    pub(crate) fn run(mut self, rx: Receiver<Command>) {
        while let Ok(command) = rx.recv() {
            if !self.handle(command) {
                break;
            }
        }
        for buffer in &self.buffers {
            let _ = buffer.close_filehandle();
        }
        debug!(root = %self.root.display(), "coordinator stopped");
    }

    /// Process one command; false stops the loop
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Index { postings, reply } => {
                let result = self.do_index(postings);
                let fatal = matches!(&result, Err(e) if e.is_fatal());
                let _ = reply.send(result);
                if fatal {
                    error!("buffer converter died; stopping store");
                    return false;
                }
            }
            Command::Info { key, reply } => {
                let _ = reply.send(Ok(self.do_info(&key)));
            }
            Command::Stream {
                key,
                filter,
                out,
                reply,
            } => {
                self.spawn_reader(StreamJob::Key(key), filter, out);
                let _ = reply.send(Ok(()));
            }
            Command::Range {
                index,
                field,
                start_term,
                end_term,
                size,
                filter,
                out,
                reply,
            } => {
                self.spawn_reader(
                    StreamJob::Range {
                        index,
                        field,
                        start_term,
                        end_term,
                        size,
                    },
                    filter,
                    out,
                );
                let _ = reply.send(Ok(()));
            }
            Command::Fold { out, reply } => {
                let result = self.do_fold(&out);
                drop(out);
                let _ = reply.send(result);
            }
            Command::IsEmpty { reply } => {
                let empty = self.buffers.iter().all(|b| b.is_empty()) && self.segments.is_empty();
                let _ = reply.send(Ok(empty));
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(StoreStatus {
                    buffer_count: self.buffers.len(),
                    segment_count: self.segments.len(),
                    segment_bytes: self.segments.iter().map(|s| s.filesize()).sum(),
                    compacting: self.compacting.is_some(),
                }));
            }
            Command::DropAll { reply } => {
                let _ = reply.send(self.do_drop_all());
            }
            Command::Compact { reply } => {
                if let Some(pending) = self.compacting.as_mut() {
                    // Join the in-flight pass; replied to with its
                    // real result when it finishes
                    pending.requesters.push(reply);
                } else {
                    let candidates = compactor::select_candidates(
                        &self.segments,
                        self.config.max_compact_segments,
                    );
                    if candidates.is_empty() {
                        let _ = reply.send(Ok(CompactSummary::empty()));
                    } else {
                        self.compacting = Some(PendingCompaction {
                            requesters: vec![reply],
                        });
                        compactor::spawn(
                            self.root.clone(),
                            candidates,
                            self.config.segment_block_size,
                            self.self_tx.clone(),
                        );
                    }
                }
            }
            Command::ConvertDone {
                buffer,
                segment_name,
            } => {
                if let Err(e) = self.finish_convert(&buffer, &segment_name) {
                    error!(buffer = buffer.id(), segment = %segment_name, error = %e,
                           "failed to install converted segment");
                }
            }
            Command::ConvertFailed { buffer_id, error } => {
                // The sealed buffer stays in the list; the next startup
                // sweep re-queues it
                warn!(buffer = buffer_id, error = %error, "buffer conversion failed");
            }
            Command::CompactionDone {
                new_name,
                old_names,
                bytes,
            } => {
                self.finish_compaction(new_name, old_names, bytes);
            }
            Command::CompactionFailed { error } => {
                warn!(error = %error, "compaction task failed");
                if let Some(pending) = self.compacting.take() {
                    for requester in pending.requesters {
                        let _ = requester
                            .send(Err(MergeIndexError::CompactionFailed(error.clone())));
                    }
                }
            }
            Command::StreamDone { stream_id } => {
                if let Some(snapshot) = self.streams.remove(&stream_id) {
                    for name in &snapshot.names {
                        self.locks.release(name);
                    }
                }
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn head(&self) -> &Arc<Buffer> {
        self.buffers.last().expect("buffer list always has a head")
    }

    fn do_index(&mut self, postings: Vec<Posting>) -> Result<()> {
        self.head().write(&postings, self.config.fsync_on_write)?;
        if self.head().filesize() > self.rollover_size {
            self.rollover()?;
        }
        Ok(())
    }

    /// Seal the head, queue it for conversion and start a fresh head
    /// with a newly fuzzed threshold
    fn rollover(&mut self) -> Result<()> {
        let head = self.head().clone();
        head.close_filehandle()?;
        self.convert_tx
            .send(ConvertTask { buffer: head })
            .map_err(|_| MergeIndexError::ConverterDead)?;

        let id = self.next_id;
        let fresh = Arc::new(Buffer::open(
            self.root.join(format!("{}.{}", flags::BUFFER_PREFIX, id)),
            id,
        )?);
        self.buffers.push(fresh);
        self.next_id += 1;
        self.rollover_size = self.config.fuzzed_rollover_size(&mut rand::thread_rng());
        debug!(
            head = id,
            next_threshold = self.rollover_size,
            "head buffer rolled over"
        );
        Ok(())
    }

    fn do_info(&self, key: &Key) -> u64 {
        let buffered: u64 = self.buffers.iter().map(|b| b.info(key)).sum();
        let weighted: u64 = self.segments.iter().map(|s| s.info(key)).sum();
        buffered + weighted
    }

    fn spawn_reader(&mut self, job: StreamJob, filter: Option<Filter>, out: Sender<StreamMessage>) {
        let buffers = self.buffers.clone();
        let segments = self.segments.clone();

        let mut names = Vec::with_capacity(buffers.len() + segments.len());
        names.extend(buffers.iter().map(|b| b.name()));
        names.extend(segments.iter().map(|s| s.name().to_string()));
        for name in &names {
            self.locks.claim(name);
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.insert(stream_id, StreamSnapshot { names });

        stream::spawn(
            stream_id,
            buffers,
            segments,
            job,
            filter,
            out,
            self.self_tx.clone(),
        );
    }

    /// Apply `out` to every posting in every buffer and segment, without
    /// deduplication. Runs on the coordinator thread by design.
    fn do_fold(&self, out: &Sender<Posting>) -> Result<()> {
        for buffer in &self.buffers {
            for posting in buffer.iter() {
                if out.send(posting).is_err() {
                    return Ok(());
                }
            }
        }
        for segment in &self.segments {
            for item in segment.iter()? {
                if out.send(item?).is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn do_drop_all(&mut self) -> Result<()> {
        if let Some(pending) = self.compacting.take() {
            for requester in pending.requesters {
                let _ = requester.send(Err(MergeIndexError::CompactionFailed(
                    "store dropped".to_string(),
                )));
            }
        }
        for buffer in self.buffers.drain(..) {
            let _ = buffer.close_filehandle();
            buffer.delete()?;
        }
        for segment in self.segments.drain(..) {
            segment.delete()?;
        }

        let head = Arc::new(Buffer::open(
            self.root.join(format!("{}.1", flags::BUFFER_PREFIX)),
            1,
        )?);
        self.buffers.push(head);
        self.next_id = 2;
        self.rollover_size = self.config.fuzzed_rollover_size(&mut rand::thread_rng());
        info!(root = %self.root.display(), "store dropped and reset");
        Ok(())
    }

    /// Swap a converted buffer out of the visible lists for its segment.
    /// Identity is by Arc, not id: after `drop_all` a fresh buffer may
    /// reuse the id of one still in the converter.
    fn finish_convert(&mut self, buffer: &Arc<Buffer>, segment_name: &str) -> Result<()> {
        let position = match self.buffers.iter().position(|b| Arc::ptr_eq(b, buffer)) {
            Some(p) => p,
            None => {
                // The buffer vanished from the list (dropped store):
                // the fresh segment is garbage
                warn!(buffer = buffer.id(), segment = %segment_name,
                      "discarding converted segment for vanished buffer");
                flags::set_flag(&self.root, segment_name)?;
                return flags::delete_family(&self.root, segment_name);
            }
        };

        flags::clear_flag(&self.root, segment_name)?;
        let segment = Arc::new(SegmentReader::open(&self.root, segment_name)?);

        let buffer_name = buffer.name();
        flags::set_flag(&self.root, &buffer_name)?;
        let root = self.root.clone();
        let name = buffer_name.clone();
        self.locks.when_free(
            &buffer_name,
            Box::new(move || {
                let _ = flags::delete_family(&root, &name);
            }),
        );

        self.buffers.remove(position);
        self.segments.insert(0, segment);
        debug!(buffer = buffer.id(), segment = %segment_name, "segment installed");

        self.maybe_schedule_compaction();
        Ok(())
    }

    fn finish_compaction(&mut self, new_name: String, old_names: Vec<String>, bytes: u64) {
        let pending = match self.compacting.take() {
            Some(p) => p,
            None => {
                // The slot was cleared underneath the task (dropped
                // store): its output is garbage
                warn!(segment = %new_name, "discarding stale compaction output");
                let _ = flags::set_flag(&self.root, &new_name);
                let _ = flags::delete_family(&self.root, &new_name);
                return;
            }
        };

        let result = (|| -> Result<CompactSummary> {
            flags::clear_flag(&self.root, &new_name)?;
            let segment = Arc::new(SegmentReader::open(&self.root, &new_name)?);

            for old in &old_names {
                flags::set_flag(&self.root, old)?;
                let root = self.root.clone();
                let name = old.clone();
                self.locks.when_free(
                    old,
                    Box::new(move || {
                        let _ = flags::delete_family(&root, &name);
                    }),
                );
            }
            self.segments
                .retain(|s| !old_names.iter().any(|n| n == s.name()));
            self.segments.insert(0, segment);

            info!(new = %new_name, merged = old_names.len(), bytes, "compaction installed");
            Ok(CompactSummary {
                segments_merged: old_names.len(),
                bytes_merged: bytes,
            })
        })();

        if let Err(e) = &result {
            error!(new = %new_name, error = %e, "failed to install compacted segment");
        }
        for requester in pending.requesters {
            let _ = requester.send(match &result {
                Ok(summary) => Ok(*summary),
                Err(e) => Err(MergeIndexError::CompactionFailed(e.to_string())),
            });
        }
    }

    fn maybe_schedule_compaction(&mut self) {
        if self.compacting.is_some() {
            return;
        }
        let candidates =
            compactor::select_candidates(&self.segments, self.config.max_compact_segments);
        if candidates.is_empty() {
            return;
        }
        debug!(candidates = candidates.len(), "scheduling compaction");
        self.compacting = Some(PendingCompaction {
            requesters: Vec::new(),
        });
        compactor::spawn(
            self.root.clone(),
            candidates,
            self.config.segment_block_size,
            self.self_tx.clone(),
        );
    }
}
