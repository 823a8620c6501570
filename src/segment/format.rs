//! Block framing and the per-key offsets table
//!
//! The data file is a sequence of frames, each holding one block:
//! - u32 length (little endian)
//! - u32 crc32 of payload
//! - payload: bincode `Vec<Posting>` in composite order
//!
//! A block packs one or more consecutive keys up to the configured block
//! size; a key large enough to fill a block on its own gets a dedicated
//! one. The offsets file is one bincode `Vec<OffsetEntry>`, per key.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Key, Posting};

pub const FRAME_HEADER_BYTES: u64 = 8;

pub fn data_file(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{}.{}", name, crate::flags::DATA_SUFFIX))
}

pub fn offsets_file(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{}.{}", name, crate::flags::OFFSETS_SUFFIX))
}

/// Location of one key's postings inside the data file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OffsetEntry {
    pub key: Key,
    pub block: BlockRef,
}

/// A frame position plus how the block is shared
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BlockRef {
    /// Frame start offset in the data file
    pub offset: u64,
    /// Whole frame length in bytes (header included)
    pub len: u32,
    /// Entries for this key within the block
    pub count: u64,
    /// Distinct keys sharing the block
    pub keys_in_block: u32,
}

/// Write one frame; returns its total length in bytes
pub fn write_frame(w: &mut impl Write, payload: &[u8]) -> io::Result<u64> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&hasher.finalize().to_le_bytes())?;
    w.write_all(payload)?;
    Ok(FRAME_HEADER_BYTES + payload.len() as u64)
}

/// Read and verify one frame; `Ok(None)` at clean end-of-file
pub fn read_frame(r: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 8];
    match r.read_exact(&mut header[..1]) {
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        other => other?,
    }
    r.read_exact(&mut header[1..])?;
    let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(header[4..].try_into().unwrap());

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != crc {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "block checksum mismatch",
        ));
    }
    Ok(Some(payload))
}

pub fn decode_block(payload: &[u8]) -> Result<Vec<Posting>> {
    Ok(bincode::deserialize(payload)?)
}

pub fn encode_block(block: &[Posting]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(block)?)
}
