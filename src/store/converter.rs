//! Background worker converting sealed buffers into segments
//!
//! The converter owns a queue of seal-to-segment tasks and never touches
//! coordinator state: each finished segment is handed back by message.
//! The output is written behind a deleteme flag so a crash mid-conversion
//! leaves only a flagged family for the startup sweep; the sealed buffer
//! itself is untouched until the coordinator swaps it out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, warn};

use super::Command;
use crate::buffer::Buffer;
use crate::error::Result;
use crate::flags;
use crate::segment::SegmentWriter;

pub(crate) struct ConvertTask {
    pub buffer: Arc<Buffer>,
}

pub(crate) fn spawn(
    rx: Receiver<ConvertTask>,
    coordinator: Sender<Command>,
    root: PathBuf,
    block_size: u64,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(task) = rx.recv() {
            let name = format!("{}.{}", flags::SEGMENT_PREFIX, task.buffer.id());
            match convert(&root, &task.buffer, &name, block_size) {
                Ok(entries) => {
                    debug!(buffer = task.buffer.id(), segment = %name, entries, "buffer converted");
                    if coordinator
                        .send(Command::ConvertDone {
                            buffer: task.buffer,
                            segment_name: name,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!(buffer = task.buffer.id(), error = %e, "buffer conversion failed");
                    if coordinator
                        .send(Command::ConvertFailed {
                            buffer_id: task.buffer.id(),
                            error: e.to_string(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    })
}

fn convert(root: &Path, buffer: &Buffer, name: &str, block_size: u64) -> Result<u64> {
    flags::set_flag(root, name)?;
    let writer = SegmentWriter::create(root, name, block_size)?;
    writer.write_all(buffer.iter().map(Ok))
}
