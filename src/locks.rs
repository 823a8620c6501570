//! Reference-counted registry of filenames with deferred release actions
//!
//! Stream readers hold claims on every buffer and segment file in their
//! snapshot; deletion of a replaced file is registered as a release action
//! and runs only once the last claim is gone. The registry is touched only
//! from the coordinator thread, so it needs no internal locking.

use std::collections::HashMap;

/// Action to run when a name's refcount drops to zero
pub type ReleaseAction = Box<dyn FnOnce() + Send>;

struct LockEntry {
    count: usize,
    on_free: Option<ReleaseAction>,
}

/// Refcount registry keyed by file name
#[derive(Default)]
pub struct Locks {
    entries: HashMap<String, LockEntry>,
}

impl Locks {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Increment the refcount for `name`, initializing it to 1
    pub fn claim(&mut self, name: &str) {
        self.entries
            .entry(name.to_string())
            .and_modify(|e| e.count += 1)
            .or_insert(LockEntry {
                count: 1,
                on_free: None,
            });
    }

    /// Decrement the refcount for `name`; at zero, remove the entry and
    /// run its release action exactly once
    pub fn release(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                let entry = self.entries.remove(name).unwrap();
                if let Some(action) = entry.on_free {
                    action();
                }
            }
        }
    }

    /// Run `action` now if `name` is untracked, otherwise store it
    /// (last write wins) to run at release
    pub fn when_free(&mut self, name: &str, action: ReleaseAction) {
        match self.entries.get_mut(name) {
            None => action(),
            Some(entry) => entry.on_free = Some(action),
        }
    }

    /// Current refcount for `name` (0 if untracked)
    pub fn count(&self, name: &str) -> usize {
        self.entries.get(name).map(|e| e.count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_claim_release() {
        let mut locks = Locks::new();
        locks.claim("f");
        locks.claim("f");
        assert_eq!(locks.count("f"), 2);
        locks.release("f");
        assert_eq!(locks.count("f"), 1);
        locks.release("f");
        assert_eq!(locks.count("f"), 0);
    }

    #[test]
    fn test_when_free_immediate() {
        let mut locks = Locks::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        locks.when_free("f", Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_when_free_deferred() {
        let mut locks = Locks::new();
        let fired = Arc::new(AtomicUsize::new(0));

        locks.claim("f");
        let f = fired.clone();
        locks.when_free("f", Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        locks.claim("f");
        locks.release("f");
        // Still held by the first claim
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        locks.release("f");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_when_free_last_write_wins() {
        let mut locks = Locks::new();
        let fired = Arc::new(AtomicUsize::new(0));

        locks.claim("f");
        let f1 = fired.clone();
        locks.when_free("f", Box::new(move || {
            f1.fetch_add(1, Ordering::SeqCst);
        }));
        let f2 = fired.clone();
        locks.when_free("f", Box::new(move || {
            f2.fetch_add(10, Ordering::SeqCst);
        }));

        locks.release("f");
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_release_untracked_is_noop() {
        let mut locks = Locks::new();
        locks.release("nope");
        assert_eq!(locks.count("nope"), 0);
    }
}
