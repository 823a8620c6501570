//! In-memory write buffer backed by an append-only log
//!
//! Record format (same framing as the segment block files):
//! - u32 length (little endian)
//! - u32 crc32 of payload
//! - bincode-encoded posting
//!
//! The log is replayed on open to rebuild the in-memory map; a torn tail
//! record is truncated so a crash mid-append never poisons the buffer.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::error::{MergeIndexError, Result};
use crate::types::{Bytes, Key, Posting};

/// Composite map key: `(key, value, timestamp descending)`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    key: Key,
    value: Bytes,
    ts: Reverse<i64>,
}

struct LogFile {
    /// None once the buffer is sealed
    writer: Option<BufWriter<File>>,
    bytes: u64,
}

/// Append-only in-memory posting store with sorted iteration
///
/// Writing the same `(key, value, timestamp)` twice keeps the last props.
pub struct Buffer {
    id: u64,
    path: PathBuf,
    entries: RwLock<BTreeMap<EntryKey, Option<Bytes>>>,
    log: Mutex<LogFile>,
}

impl Buffer {
    /// Open or create the buffer log at `path`, replaying any existing
    /// records to rebuild the in-memory state
    pub fn open(path: impl AsRef<Path>, id: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = BTreeMap::new();
        let mut valid_len = 0u64;

        if path.exists() {
            let data = std::fs::read(&path)?;
            for posting in replay(&data, &mut valid_len) {
                insert(&mut entries, posting);
            }
            if valid_len < data.len() as u64 {
                warn!(
                    buffer = id,
                    dropped = data.len() as u64 - valid_len,
                    "truncating torn tail record in buffer log"
                );
                let f = OpenOptions::new().write(true).open(&path)?;
                f.set_len(valid_len)?;
                f.sync_all()?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            id,
            path,
            entries: RwLock::new(entries),
            log: Mutex::new(LogFile {
                writer: Some(BufWriter::new(file)),
                bytes: valid_len,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The buffer's file name, e.g. `buffer.3`
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Append a batch; each posting is persisted to the log before return
    pub fn write(&self, postings: &[Posting], fsync: bool) -> Result<()> {
        {
            let mut log = self.log.lock();
            let writer = log
                .writer
                .as_mut()
                .ok_or(MergeIndexError::BufferSealed(self.id))?;
            let mut appended = 0u64;
            for posting in postings {
                let payload = bincode::serialize(posting)?;
                let mut hasher = Hasher::new();
                hasher.update(&payload);
                writer.write_all(&(payload.len() as u32).to_le_bytes())?;
                writer.write_all(&hasher.finalize().to_le_bytes())?;
                writer.write_all(&payload)?;
                appended += 8 + payload.len() as u64;
            }
            writer.flush()?;
            if fsync {
                writer.get_ref().sync_all()?;
            }
            log.bytes += appended;
        }

        let mut entries = self.entries.write();
        for posting in postings {
            insert(&mut entries, posting.clone());
        }
        Ok(())
    }

    /// Bytes on disk
    pub fn filesize(&self) -> u64 {
        self.log.lock().bytes
    }

    /// Number of entries held in memory
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Count of entries matching `key`
    pub fn info(&self, key: &Key) -> u64 {
        let entries = self.entries.read();
        entries
            .range((Bound::Included(low_bound(key)), Bound::Unbounded))
            .take_while(|(k, _)| k.key == *key)
            .count() as u64
    }

    /// Point-in-time snapshot of all entries, in composite order
    pub fn iter(&self) -> impl Iterator<Item = Posting> {
        let entries = self.entries.read();
        entries
            .iter()
            .map(|(k, props)| to_posting(k, props))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Point-in-time snapshot of the entries matching `key`
    pub fn iter_key(&self, key: &Key) -> impl Iterator<Item = Posting> {
        let entries = self.entries.read();
        entries
            .range((Bound::Included(low_bound(key)), Bound::Unbounded))
            .take_while(|(k, _)| k.key == *key)
            .map(|(k, props)| to_posting(k, props))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// For each distinct term in `[start_term, end_term]` under
    /// `index`/`field`, the term and its postings in composite order.
    /// `size` bounds the number of terms returned.
    pub fn iter_terms(
        &self,
        index: &[u8],
        field: &[u8],
        start_term: &[u8],
        end_term: &[u8],
        size: Option<usize>,
    ) -> Vec<(Bytes, Vec<Posting>)> {
        let start = Key::new(index, field, start_term);
        let entries = self.entries.read();
        let mut terms: Vec<(Bytes, Vec<Posting>)> = Vec::new();

        for (k, props) in entries.range((Bound::Included(low_bound(&start)), Bound::Unbounded)) {
            if !k.key.in_field(index, field) || k.key.term.as_slice() > end_term {
                break;
            }
            let posting = to_posting(k, props);
            match terms.last_mut() {
                Some((term, postings)) if *term == k.key.term => postings.push(posting),
                _ => {
                    if size.map(|s| terms.len() >= s).unwrap_or(false) {
                        break;
                    }
                    terms.push((k.key.term.clone(), vec![posting]));
                }
            }
        }
        terms
    }

    /// Flush and close the log; the in-memory state remains queryable
    /// but further writes are rejected
    pub fn close_filehandle(&self) -> Result<()> {
        let mut log = self.log.lock();
        if let Some(mut writer) = log.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Erase the log file
    pub fn delete(&self) -> Result<()> {
        {
            let mut log = self.log.lock();
            log.writer = None;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn low_bound(key: &Key) -> EntryKey {
    EntryKey {
        key: key.clone(),
        value: Vec::new(),
        ts: Reverse(i64::MAX),
    }
}

fn insert(entries: &mut BTreeMap<EntryKey, Option<Bytes>>, posting: Posting) {
    entries.insert(
        EntryKey {
            key: posting.key,
            value: posting.value,
            ts: Reverse(posting.timestamp),
        },
        posting.props,
    );
}

fn to_posting(k: &EntryKey, props: &Option<Bytes>) -> Posting {
    Posting {
        key: k.key.clone(),
        value: k.value.clone(),
        timestamp: k.ts.0,
        props: props.clone(),
    }
}

/// Parse framed records, advancing `valid_len` past each intact one.
/// Stops at the first short or checksum-failing record.
fn replay<'a>(data: &'a [u8], valid_len: &'a mut u64) -> impl Iterator<Item = Posting> + 'a {
    let mut pos = 0usize;
    std::iter::from_fn(move || loop {
        if pos + 8 > data.len() {
            return None;
        }
        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap());
        if pos + 8 + len > data.len() {
            return None;
        }
        let payload = &data[pos + 8..pos + 8 + len];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != crc {
            return None;
        }
        pos += 8 + len;
        *valid_len = pos as u64;
        match bincode::deserialize(payload) {
            Ok(posting) => return Some(posting),
            // Checksum passed but the payload does not decode: skip it
            Err(_) => continue,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn posting(term: &str, value: &str, ts: i64, props: &str) -> Posting {
        Posting::new("idx", "fld", term, value, ts, props)
    }

    #[test]
    fn test_write_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.1");

        let buffer = Buffer::open(&path, 1).unwrap();
        buffer
            .write(
                &[posting("a", "v1", 1, "p1"), posting("b", "v2", 2, "p2")],
                false,
            )
            .unwrap();
        assert_eq!(buffer.len(), 2);
        assert!(buffer.filesize() > 0);
        buffer.close_filehandle().unwrap();
        drop(buffer);

        let reopened = Buffer::open(&path, 1).unwrap();
        assert_eq!(reopened.len(), 2);
        let all: Vec<_> = reopened.iter().collect();
        assert_eq!(all[0].key.term, b"a".to_vec());
        assert_eq!(all[1].key.term, b"b".to_vec());
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.1");

        let buffer = Buffer::open(&path, 1).unwrap();
        buffer.write(&[posting("a", "v1", 1, "p1")], false).unwrap();
        buffer.close_filehandle().unwrap();
        let good_len = std::fs::metadata(&path).unwrap().len();
        drop(buffer);

        // Simulate a crash mid-append
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[42u8; 5]).unwrap();
        drop(f);

        let reopened = Buffer::open(&path, 1).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
    }

    #[test]
    fn test_sealed_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let buffer = Buffer::open(dir.path().join("buffer.1"), 1).unwrap();
        buffer.close_filehandle().unwrap();
        let err = buffer.write(&[posting("a", "v", 1, "p")], false);
        assert!(matches!(err, Err(MergeIndexError::BufferSealed(1))));
    }

    #[test]
    fn test_newest_first_within_pair() {
        let dir = TempDir::new().unwrap();
        let buffer = Buffer::open(dir.path().join("buffer.1"), 1).unwrap();
        buffer
            .write(
                &[posting("t", "v", 1, "old"), posting("t", "v", 2, "new")],
                false,
            )
            .unwrap();

        let key = Key::new("idx", "fld", "t");
        let got: Vec<_> = buffer.iter_key(&key).collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].timestamp, 2);
        assert_eq!(got[1].timestamp, 1);
        assert_eq!(buffer.info(&key), 2);
    }

    #[test]
    fn test_same_timestamp_last_props_wins() {
        let dir = TempDir::new().unwrap();
        let buffer = Buffer::open(dir.path().join("buffer.1"), 1).unwrap();
        buffer.write(&[posting("t", "v", 1, "first")], false).unwrap();
        buffer.write(&[posting("t", "v", 1, "second")], false).unwrap();

        let key = Key::new("idx", "fld", "t");
        let got: Vec<_> = buffer.iter_key(&key).collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].props.as_deref(), Some(b"second".as_ref()));
    }

    #[test]
    fn test_iter_terms_range_and_cap() {
        let dir = TempDir::new().unwrap();
        let buffer = Buffer::open(dir.path().join("buffer.1"), 1).unwrap();
        buffer
            .write(
                &[
                    posting("a", "v1", 1, "p"),
                    posting("b", "v1", 1, "p"),
                    posting("b", "v2", 1, "p"),
                    posting("c", "v1", 1, "p"),
                    posting("d", "v1", 1, "p"),
                ],
                false,
            )
            .unwrap();

        let terms = buffer.iter_terms(b"idx", b"fld", b"b", b"d", None);
        assert_eq!(terms.len(), 3);
        assert_eq!(terms[0].0, b"b".to_vec());
        assert_eq!(terms[0].1.len(), 2);

        let capped = buffer.iter_terms(b"idx", b"fld", b"a", b"d", Some(2));
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[1].0, b"b".to_vec());
    }

    #[test]
    fn test_delete_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.9");
        let buffer = Buffer::open(&path, 9).unwrap();
        buffer.write(&[posting("a", "v", 1, "p")], false).unwrap();
        assert!(path.exists());
        buffer.delete().unwrap();
        assert!(!path.exists());
    }
}
