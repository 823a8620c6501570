//! Write-open segment: stream sorted postings into blocks
//!
//! The caller (converter or compactor) sets the deleteme flag on the
//! segment's base name before creating the writer, and the coordinator
//! clears it once the finished segment is handed back. A crash at any
//! point in between leaves a flagged family for the startup sweep.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::format::{self, BlockRef, OffsetEntry};
use crate::error::Result;
use crate::types::{Key, Posting};

/// Streaming writer for a new immutable segment
pub struct SegmentWriter {
    root: PathBuf,
    name: String,
    data: BufWriter<File>,
    offsets: Vec<OffsetEntry>,
    block: Vec<Posting>,
    /// (key, entry count) for each distinct key in the open block
    block_keys: Vec<(Key, u64)>,
    block_bytes: u64,
    offset: u64,
    block_size: u64,
    entries: u64,
}

impl SegmentWriter {
    /// Create the file pair for segment `name` under `root`
    pub fn create(root: &Path, name: &str, block_size: u64) -> Result<Self> {
        let data = File::create(format::data_file(root, name))?;
        Ok(Self {
            root: root.to_path_buf(),
            name: name.to_string(),
            data: BufWriter::new(data),
            offsets: Vec::new(),
            block: Vec::new(),
            block_keys: Vec::new(),
            block_bytes: 0,
            offset: 0,
            block_size,
            entries: 0,
        })
    }

    /// Append one posting; input must arrive in composite order
    pub fn push(&mut self, posting: Posting) -> Result<()> {
        let at_key_boundary = self
            .block_keys
            .last()
            .map(|(k, _)| *k != posting.key)
            .unwrap_or(false);
        if at_key_boundary && self.block_bytes >= self.block_size {
            self.flush_block()?;
        }

        self.block_bytes += bincode::serialized_size(&posting)?;
        match self.block_keys.last_mut() {
            Some((k, count)) if *k == posting.key => *count += 1,
            _ => self.block_keys.push((posting.key.clone(), 1)),
        }
        self.block.push(posting);
        self.entries += 1;
        Ok(())
    }

    /// Drain an iterator into the segment and finish it.
    /// Returns total entries written.
    pub fn write_all(mut self, iter: impl Iterator<Item = Result<Posting>>) -> Result<u64> {
        for posting in iter {
            self.push(posting?)?;
        }
        self.finish()
    }

    /// Flush the last block, write the offsets table and fsync both files
    pub fn finish(mut self) -> Result<u64> {
        if !self.block.is_empty() {
            self.flush_block()?;
        }
        self.data.flush()?;
        self.data.get_ref().sync_all()?;

        let table = bincode::serialize(&self.offsets)?;
        let offsets_path = format::offsets_file(&self.root, &self.name);
        let mut f = File::create(offsets_path)?;
        f.write_all(&table)?;
        f.sync_all()?;
        Ok(self.entries)
    }

    fn flush_block(&mut self) -> Result<()> {
        let payload = format::encode_block(&self.block)?;
        let frame_len = format::write_frame(&mut self.data, &payload)?;

        let keys_in_block = self.block_keys.len() as u32;
        for (key, count) in self.block_keys.drain(..) {
            self.offsets.push(OffsetEntry {
                key,
                block: BlockRef {
                    offset: self.offset,
                    len: frame_len as u32,
                    count,
                    keys_in_block,
                },
            });
        }
        self.offset += frame_len;
        self.block.clear();
        self.block_bytes = 0;
        Ok(())
    }
}
