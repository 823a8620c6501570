//! Merge-sorted iteration over a set of posting sources
//!
//! The combinator folds adjacent sources into two-way merge nodes until a
//! single root remains, so per-element work is O(log N) in the number of
//! sources. Ties are broken in favor of the earlier source; callers order
//! their sources newest-first so fresher data wins exact ties.

use crate::error::Result;
use crate::types::Posting;

/// A lazy, fallible stream of postings in composite order
pub type EntryIter = Box<dyn Iterator<Item = Result<Posting>> + Send + 'static>;

/// Build one merge-sorted iterator over `sources`
pub fn merge_entries(mut sources: Vec<EntryIter>) -> EntryIter {
    if sources.is_empty() {
        return Box::new(std::iter::empty());
    }
    // Pair adjacent sources until one root remains
    while sources.len() > 1 {
        let mut paired: Vec<EntryIter> = Vec::with_capacity((sources.len() + 1) / 2);
        let mut it = sources.into_iter();
        while let Some(left) = it.next() {
            match it.next() {
                Some(right) => paired.push(Box::new(MergeNode::new(left, right))),
                None => paired.push(left),
            }
        }
        sources = paired;
    }
    sources.pop().expect("one source remains")
}

/// Two-way merge of ordered posting streams
struct MergeNode {
    left: EntryIter,
    right: EntryIter,
    left_head: Option<Result<Posting>>,
    right_head: Option<Result<Posting>>,
}

impl MergeNode {
    fn new(mut left: EntryIter, mut right: EntryIter) -> Self {
        let left_head = left.next();
        let right_head = right.next();
        Self {
            left,
            right,
            left_head,
            right_head,
        }
    }

    fn take_left(&mut self) -> Option<Result<Posting>> {
        std::mem::replace(&mut self.left_head, self.left.next())
    }

    fn take_right(&mut self) -> Option<Result<Posting>> {
        std::mem::replace(&mut self.right_head, self.right.next())
    }
}

impl Iterator for MergeNode {
    type Item = Result<Posting>;

    fn next(&mut self) -> Option<Self::Item> {
        match (&self.left_head, &self.right_head) {
            (None, None) => None,
            (Some(_), None) => self.take_left(),
            (None, Some(_)) => self.take_right(),
            // Errors surface immediately so the consumer can abort
            (Some(Err(_)), _) => self.take_left(),
            (_, Some(Err(_))) => self.take_right(),
            (Some(Ok(l)), Some(Ok(r))) => {
                if l.stream_cmp(r) != std::cmp::Ordering::Greater {
                    self.take_left()
                } else {
                    self.take_right()
                }
            }
        }
    }
}
