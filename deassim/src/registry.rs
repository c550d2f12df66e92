//! Run-scoped hardlink identity table.
//!
//! Every regular file whose source link count is above one is claimed here
//! before anything is written to the target. Exactly one claimant per inode
//! gets [`Claim::First`] and copies the bytes; everyone else waits on the
//! record's `watch` channel until the first target path is published, then
//! links to it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::debug;

/// Source inode identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeKey {
    pub dev: u64,
    pub ino: u64,
}

impl InodeKey {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InodeState {
    Pending,
    Resolved(PathBuf),
    Abandoned,
}

/// Outcome of [`InodeRegistry::claim`]
#[derive(Debug)]
pub enum Claim<'a> {
    /// Caller owns the copy and must resolve (or drop) the claim
    First(FirstClaim<'a>),
    /// Target path already created by the first claimant
    Linked(PathBuf),
}

#[derive(Default)]
pub struct InodeRegistry {
    records: DashMap<InodeKey, watch::Receiver<InodeState>>,
}

impl InodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. Suspends while another caller holds an unresolved claim.
    pub async fn claim(&self, key: InodeKey) -> Claim<'_> {
        loop {
            let mut rx = match self.records.entry(key) {
                Entry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(InodeState::Pending);
                    vacant.insert(rx);
                    return Claim::First(FirstClaim {
                        registry: self,
                        key,
                        tx: Some(tx),
                    });
                }
                Entry::Occupied(occupied) => occupied.get().clone(),
            };

            let state = match rx.wait_for(|s| *s != InodeState::Pending).await {
                Ok(state) => state.clone(),
                Err(_) => InodeState::Abandoned,
            };

            match state {
                InodeState::Resolved(path) => return Claim::Linked(path),
                // First claimant gave up and removed the record; race for it again.
                _ => {
                    debug!("Claim on inode {:?} abandoned, re-claiming", key);
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Resolved target path for `key`, if any
    pub fn lookup(&self, key: InodeKey) -> Option<PathBuf> {
        self.records.get(&key).and_then(|rx| match &*rx.borrow() {
            InodeState::Resolved(path) => Some(path.clone()),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Exclusive right to create the first target path of an inode.
///
/// Dropping it without calling [`FirstClaim::resolve`] removes the record and
/// wakes the waiters so one of them takes over.
#[derive(Debug)]
pub struct FirstClaim<'a> {
    registry: &'a InodeRegistry,
    key: InodeKey,
    tx: Option<watch::Sender<InodeState>>,
}

impl FirstClaim<'_> {
    /// Publish the created target path to every other claimant
    pub fn resolve(mut self, target: &Path) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(InodeState::Resolved(target.to_path_buf()));
        }
    }
}

impl Drop for FirstClaim<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            // Remove before waking, so a woken waiter finds the slot vacant.
            self.registry.records.remove(&self.key);
            tx.send_replace(InodeState::Abandoned);
        }
    }
}

impl std::fmt::Debug for InodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeRegistry")
            .field("records", &self.records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_claim_then_linked() {
        let registry = InodeRegistry::new();
        let key = InodeKey::new(1, 42);

        match registry.claim(key).await {
            Claim::First(first) => first.resolve(Path::new("/vol/d/A")),
            Claim::Linked(_) => panic!("empty registry must hand out a first claim"),
        }

        match registry.claim(key).await {
            Claim::Linked(path) => assert_eq!(path, PathBuf::from("/vol/d/A")),
            Claim::First(_) => panic!("second claim must not be first"),
        }
        assert_eq!(registry.lookup(key), Some(PathBuf::from("/vol/d/A")));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_exactly_one_first() {
        let registry = Arc::new(InodeRegistry::new());
        let key = InodeKey::new(7, 1000);
        let mut handles = Vec::new();

        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                match registry.claim(key).await {
                    Claim::First(first) => {
                        // Keep waiters suspended for a while before publishing.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        let path = PathBuf::from(format!("/vol/copy-{}", i));
                        first.resolve(&path);
                        (true, path)
                    }
                    Claim::Linked(path) => (false, path),
                }
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let firsts: Vec<_> = results.iter().filter(|(first, _)| *first).collect();
        assert_eq!(firsts.len(), 1);
        let winner = firsts[0].1.clone();
        assert!(results.iter().all(|(_, path)| *path == winner));
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_taken_over() {
        let registry = Arc::new(InodeRegistry::new());
        let key = InodeKey::new(3, 3);

        let first = match registry.claim(key).await {
            Claim::First(first) => first,
            Claim::Linked(_) => panic!("expected first claim"),
        };

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                match registry.claim(key).await {
                    Claim::First(second) => {
                        second.resolve(Path::new("/vol/retry"));
                        true
                    }
                    Claim::Linked(_) => false,
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        assert!(waiter.await.unwrap(), "waiter should become the new first claimant");
        assert_eq!(registry.lookup(key), Some(PathBuf::from("/vol/retry")));
    }
}
