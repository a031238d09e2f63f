use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Owner name that may release any lock regardless of holder.
pub const FORCE_OWNER: &str = "force";

/// A held lock on one shared artifact.
#[derive(Debug, Clone)]
pub struct LockRecord {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

/// Advisory lock serializing writes to one shared mutable artifact.
///
/// In-process only: the lock table lives behind a mutex in this struct, which
/// is constructed once and shared through the engine context. Records exist
/// only while held; document versions survive release and increase
/// monotonically across acquire→write→release cycles.
pub struct DocumentLock {
    locks: Mutex<HashMap<String, LockRecord>>,
    versions: Mutex<HashMap<String, u64>>,
    poll_interval: Duration,
}

impl DocumentLock {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    /// Acquire a lock on a resource, polling until free or `timeout` elapses.
    ///
    /// Re-acquiring a lock already held by the same owner is a no-op success.
    pub async fn acquire(&self, resource: &str, owner: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut locks = self.locks.lock().expect("lock table poisoned");
                match locks.get(resource) {
                    None => {
                        locks.insert(
                            resource.to_string(),
                            LockRecord {
                                owner: owner.to_string(),
                                acquired_at: Utc::now(),
                            },
                        );
                        debug!(resource, owner, "Lock acquired");
                        return true;
                    }
                    Some(record) if record.owner == owner => {
                        // Reentrant: same owner may re-acquire.
                        return true;
                    }
                    Some(_) => {}
                }
            }

            if Instant::now() >= deadline {
                warn!(resource, owner, "Timeout acquiring lock");
                return false;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Release a lock. Only the owner (or [`FORCE_OWNER`]) may release a held
    /// lock; releasing an unheld resource succeeds trivially.
    pub fn release(&self, resource: &str, owner: &str) -> bool {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        match locks.get(resource) {
            Some(record) if record.owner == owner || owner == FORCE_OWNER => {
                locks.remove(resource);
                debug!(resource, owner, "Lock released");
                true
            }
            Some(record) => {
                warn!(resource, owner, holder = %record.owner, "Cannot release lock: not owner");
                false
            }
            None => true,
        }
    }

    pub fn is_locked(&self, resource: &str) -> bool {
        self.locks
            .lock()
            .expect("lock table poisoned")
            .contains_key(resource)
    }

    pub fn lock_info(&self, resource: &str) -> Option<LockRecord> {
        self.locks
            .lock()
            .expect("lock table poisoned")
            .get(resource)
            .cloned()
    }

    /// Current document revision. Zero until the first successful write.
    pub fn current_version(&self, resource: &str) -> u64 {
        self.versions
            .lock()
            .expect("version table poisoned")
            .get(resource)
            .copied()
            .unwrap_or(0)
    }

    /// Bump the document revision after a successful write. The caller must
    /// hold the lock; a non-owner bump is refused and returns the current
    /// version unchanged.
    pub fn increment_version(&self, resource: &str, owner: &str) -> u64 {
        let holds = {
            let locks = self.locks.lock().expect("lock table poisoned");
            locks
                .get(resource)
                .map(|r| r.owner == owner || owner == FORCE_OWNER)
                .unwrap_or(false)
        };

        let mut versions = self.versions.lock().expect("version table poisoned");
        let entry = versions.entry(resource.to_string()).or_insert(0);
        if holds {
            *entry += 1;
        } else {
            warn!(resource, owner, "Version bump refused: lock not held by owner");
        }
        *entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn lock() -> DocumentLock {
        DocumentLock::new(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let lock = lock();
        assert!(lock.acquire("job-1", "report", Duration::from_millis(50)).await);
        assert!(lock.is_locked("job-1"));
        assert!(lock.release("job-1", "report"));
        assert!(!lock.is_locked("job-1"));
    }

    #[tokio::test]
    async fn reentrant_same_owner() {
        let lock = lock();
        assert!(lock.acquire("job-1", "report", Duration::from_millis(50)).await);
        assert!(lock.acquire("job-1", "report", Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn second_owner_times_out() {
        let lock = lock();
        assert!(lock.acquire("job-1", "report", Duration::from_millis(50)).await);
        assert!(!lock.acquire("job-1", "editor", Duration::from_millis(60)).await);
    }

    #[tokio::test]
    async fn concurrent_acquires_are_mutually_exclusive() {
        let lock = Arc::new(DocumentLock::new(Duration::from_millis(5)));

        let a = {
            let lock = lock.clone();
            tokio::spawn(
                async move { lock.acquire("job-1", "writer-a", Duration::from_millis(40)).await },
            )
        };
        let b = {
            let lock = lock.clone();
            tokio::spawn(
                async move { lock.acquire("job-1", "writer-b", Duration::from_millis(40)).await },
            )
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        // Exactly one wins; the loser times out because the winner never releases.
        assert!(a ^ b, "both or neither acquired: a={} b={}", a, b);
    }

    #[tokio::test]
    async fn non_owner_cannot_release_but_force_can() {
        let lock = lock();
        lock.acquire("job-1", "report", Duration::from_millis(50)).await;
        assert!(!lock.release("job-1", "editor"));
        assert!(lock.is_locked("job-1"));
        assert!(lock.release("job-1", FORCE_OWNER));
        assert!(!lock.is_locked("job-1"));
    }

    #[tokio::test]
    async fn version_is_monotonic_across_cycles() {
        let lock = lock();
        assert_eq!(lock.current_version("job-1"), 0);

        for expected in 1..=3u64 {
            lock.acquire("job-1", "report", Duration::from_millis(50)).await;
            assert_eq!(lock.increment_version("job-1", "report"), expected);
            lock.release("job-1", "report");
        }

        assert_eq!(lock.current_version("job-1"), 3);
    }

    #[tokio::test]
    async fn version_bump_requires_holding_the_lock() {
        let lock = lock();
        lock.acquire("job-1", "report", Duration::from_millis(50)).await;
        lock.increment_version("job-1", "report");

        // An owner that does not hold the lock cannot bump.
        assert_eq!(lock.increment_version("job-1", "editor"), 1);

        // Waiting for a held lock is bounded by the timeout, never silent.
        assert!(!lock.acquire("job-1", "editor", Duration::from_millis(30)).await);
    }
}
