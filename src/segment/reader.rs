//! Read-open segment: random term lookup and ordered iteration
//!
//! The offsets table is held in memory; posting blocks are read on
//! demand. Full scans stream the data file front to back with their own
//! file handle, so concurrent readers never contend on a seek position.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::format::{self, BlockRef};
use crate::error::{MergeIndexError, Result};
use crate::merge::EntryIter;
use crate::types::{Bytes, Key, Posting};

/// Immutable sorted posting file, opened read-only
pub struct SegmentReader {
    root: PathBuf,
    name: String,
    offsets: BTreeMap<Key, BlockRef>,
    filesize: u64,
    file: Mutex<File>,
}

impl SegmentReader {
    pub fn open(root: &Path, name: &str) -> Result<Self> {
        let table = std::fs::read(format::offsets_file(root, name))?;
        let entries: Vec<format::OffsetEntry> =
            bincode::deserialize(&table).map_err(|e| MergeIndexError::SegmentCorrupt {
                name: name.to_string(),
                reason: format!("offsets table: {}", e),
            })?;
        let offsets = entries.into_iter().map(|e| (e.key, e.block)).collect();

        let data_path = format::data_file(root, name);
        let filesize = std::fs::metadata(&data_path)?.len();
        let file = File::open(&data_path)?;

        Ok(Self {
            root: root.to_path_buf(),
            name: name.to_string(),
            offsets,
            filesize,
            file: Mutex::new(file),
        })
    }

    /// The segment's base name, e.g. `segment.4`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes in the data file
    pub fn filesize(&self) -> u64 {
        self.filesize
    }

    /// Selectivity weight for `key`: zero when the key shares its block
    /// with other keys, else the block size in bytes. Not a count.
    pub fn info(&self, key: &Key) -> u64 {
        match self.offsets.get(key) {
            Some(block) if block.keys_in_block == 1 => block.len as u64,
            _ => 0,
        }
    }

    /// Lazy scan of the whole segment in composite order
    pub fn iter(&self) -> Result<EntryIter> {
        let file = File::open(format::data_file(&self.root, &self.name))?;
        Ok(Box::new(ScanIter {
            reader: BufReader::new(file),
            current: Vec::new().into_iter(),
            failed: false,
        }))
    }

    /// Lazy stream of the entries matching `key`
    pub fn iter_key(self: Arc<Self>, key: &Key) -> EntryIter {
        Box::new(KeyIter {
            segment: self,
            key: key.clone(),
            loaded: None,
            failed: false,
        })
    }

    /// For each distinct term in `[start_term, end_term]` under
    /// `index`/`field`: the term and a lazy stream of its postings.
    /// `size` bounds the number of terms.
    pub fn iter_terms(
        self: Arc<Self>,
        index: &[u8],
        field: &[u8],
        start_term: &[u8],
        end_term: &[u8],
        size: Option<usize>,
    ) -> Vec<(Bytes, EntryIter)> {
        let start = Key::new(index, field, start_term);
        let mut terms: Vec<(Bytes, EntryIter)> = Vec::new();
        for key in self
            .offsets
            .range((Bound::Included(&start), Bound::Unbounded))
            .map(|(k, _)| k)
        {
            if !key.in_field(index, field) || key.term.as_slice() > end_term {
                break;
            }
            if size.map(|s| terms.len() >= s).unwrap_or(false) {
                break;
            }
            terms.push((key.term.clone(), Arc::clone(&self).iter_key(key)));
        }
        terms
    }

    /// Remove the segment's files
    pub fn delete(&self) -> Result<()> {
        crate::flags::delete_family(&self.root, &self.name)
    }

    /// Read the block holding `key` and keep only that key's entries
    fn read_key(&self, key: &Key) -> Result<Vec<Posting>> {
        let block = match self.offsets.get(key) {
            Some(block) => *block,
            None => return Ok(Vec::new()),
        };

        let mut frame = vec![0u8; block.len as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(block.offset))?;
            file.read_exact(&mut frame)?;
        }
        let payload = format::read_frame(&mut frame.as_slice())?.ok_or_else(|| {
            MergeIndexError::SegmentCorrupt {
                name: self.name.clone(),
                reason: "empty block frame".to_string(),
            }
        })?;

        let mut postings = format::decode_block(&payload)?;
        postings.retain(|p| p.key == *key);
        Ok(postings)
    }
}

struct ScanIter {
    reader: BufReader<File>,
    current: std::vec::IntoIter<Posting>,
    failed: bool,
}

impl Iterator for ScanIter {
    type Item = Result<Posting>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(posting) = self.current.next() {
                return Some(Ok(posting));
            }
            match format::read_frame(&mut self.reader) {
                Ok(None) => return None,
                Ok(Some(payload)) => match format::decode_block(&payload) {
                    Ok(block) => self.current = block.into_iter(),
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                },
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

struct KeyIter {
    segment: Arc<SegmentReader>,
    key: Key,
    loaded: Option<std::vec::IntoIter<Posting>>,
    failed: bool,
}

impl Iterator for KeyIter {
    type Item = Result<Posting>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.loaded.is_none() {
            match self.segment.read_key(&self.key) {
                Ok(postings) => self.loaded = Some(postings.into_iter()),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        self.loaded.as_mut().and_then(|it| it.next()).map(Ok)
    }
}
