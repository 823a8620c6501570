//! Core types for the merge-index
//!
//! A posting is the unit of data: `(index, field, term, value, timestamp,
//! props)`. Postings order lexicographically by `(index, field, term,
//! value)` with the timestamp compared descending, so the newest write for
//! a `(key, value)` pair is always encountered first during merge-sorted
//! iteration. The same ordering is used in the buffer and in segments.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque byte payloads used for index/field/term/value/props
pub type Bytes = Vec<u8>;

/// The `(index, field, term)` triple - the unit of term lookup
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub index: Bytes,
    pub field: Bytes,
    pub term: Bytes,
}

impl Key {
    pub fn new(index: impl Into<Bytes>, field: impl Into<Bytes>, term: impl Into<Bytes>) -> Self {
        Self {
            index: index.into(),
            field: field.into(),
            term: term.into(),
        }
    }

    /// True if this key belongs to the given index/field pair
    pub fn in_field(&self, index: &[u8], field: &[u8]) -> bool {
        self.index == index && self.field == field
    }
}

/// A single indexed fact
///
/// `props == None` is the tombstone sentinel: it deletes every
/// lower-timestamp posting for the same `(key, value)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub key: Key,
    pub value: Bytes,
    pub timestamp: i64,
    pub props: Option<Bytes>,
}

impl Posting {
    pub fn new(
        index: impl Into<Bytes>,
        field: impl Into<Bytes>,
        term: impl Into<Bytes>,
        value: impl Into<Bytes>,
        timestamp: i64,
        props: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: Key::new(index, field, term),
            value: value.into(),
            timestamp,
            props: Some(props.into()),
        }
    }

    /// A deletion marker for `(key, value)` at the given timestamp
    pub fn tombstone(
        index: impl Into<Bytes>,
        field: impl Into<Bytes>,
        term: impl Into<Bytes>,
        value: impl Into<Bytes>,
        timestamp: i64,
    ) -> Self {
        Self {
            key: Key::new(index, field, term),
            value: value.into(),
            timestamp,
            props: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.props.is_none()
    }
}

impl Posting {
    /// Composite stream ordering: `(key, value, timestamp descending)`.
    ///
    /// Props are not compared, so postings that differ only in props are
    /// stream-equal and merge nodes fall back to source order for them.
    pub fn stream_cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.value.cmp(&other.value))
            // Descending: newer timestamps sort before older ones
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

/// Per-posting predicate applied by stream readers: `filter(value, props)`
pub type Filter = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_ordering() {
        let a = Posting::new("i", "f", "a", "v", 1, "p");
        let b = Posting::new("i", "f", "b", "v", 1, "p");
        assert_eq!(a.stream_cmp(&b), Ordering::Less);

        let later = Posting::new("i", "f", "a", "v", 2, "p");
        // Newer timestamp sorts first for the same (key, value)
        assert_eq!(later.stream_cmp(&a), Ordering::Less);

        let other_value = Posting::new("i", "f", "a", "w", 9, "p");
        assert_eq!(a.stream_cmp(&other_value), Ordering::Less);

        let other_props = Posting::new("i", "f", "a", "v", 1, "q");
        assert_eq!(a.stream_cmp(&other_props), Ordering::Equal);
    }

    #[test]
    fn test_tombstone() {
        let dead = Posting::tombstone("i", "f", "t", "v", 5);
        assert!(dead.is_tombstone());
        assert!(!Posting::new("i", "f", "t", "v", 5, "p").is_tombstone());
    }

    #[test]
    fn test_key_in_field() {
        let key = Key::new("idx", "fld", "term");
        assert!(key.in_field(b"idx", b"fld"));
        assert!(!key.in_field(b"idx", b"other"));
    }
}
