//! Process-wide registry of identifiers currently being driven.
//!
//! An identifier (account uid or queue name) is a member exactly while some
//! runner for it is executing. Membership is both the admission check and
//! the cross-queue exclusion rule, so insertion is test-and-set under one
//! lock and removal is tied to a guard's drop.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct RunningSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl RunningSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // A poisoned set still holds valid membership data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert `id` if absent. Returns false when it was already present.
    pub fn try_insert(&self, id: &str) -> bool {
        self.lock().insert(id.to_string())
    }

    /// Insert `id` and return a guard that removes it on drop.
    pub fn claim(&self, id: &str) -> Option<RunningGuard> {
        self.try_insert(id).then(|| RunningGuard {
            set: self.clone(),
            id: id.to_string(),
        })
    }

    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Sorted copy of the current members.
    pub fn snapshot(&self) -> BTreeSet<String> {
        self.lock().iter().cloned().collect()
    }
}

/// Membership held for the lifetime of one runner.
#[derive(Debug)]
pub struct RunningGuard {
    set: RunningSet,
    id: String,
}

impl RunningGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_test_and_set() {
        let set = RunningSet::new();
        assert!(set.try_insert("a"));
        assert!(!set.try_insert("a"));
        assert!(set.contains("a"));
        assert_eq!(set.len(), 1);
        assert!(set.remove("a"));
        assert!(!set.remove("a"));
        assert!(set.is_empty());
    }

    #[test]
    fn guard_releases_on_drop() {
        let set = RunningSet::new();
        {
            let guard = set.claim("uid-1").unwrap();
            assert_eq!(guard.id(), "uid-1");
            assert!(set.claim("uid-1").is_none());
        }
        assert!(!set.contains("uid-1"));
    }

    #[test]
    fn guard_releases_on_panic() {
        let set = RunningSet::new();
        let cloned = set.clone();
        let result = std::thread::spawn(move || {
            let _guard = cloned.claim("uid-2").unwrap();
            panic!("runner blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(set.is_empty());
    }

    #[test]
    fn concurrent_claims_admit_exactly_one() {
        let set = RunningSet::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let set = set.clone();
                std::thread::spawn(move || set.try_insert("shared"))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(
            set.snapshot().into_iter().collect::<Vec<_>>(),
            vec!["shared"]
        );
    }
}
