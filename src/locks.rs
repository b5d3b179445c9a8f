//! Per-repository mutual exclusion.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Process-wide table of held repository locks.
///
/// One shared wakeup is broadcast on every release and waiters re-check the
/// held set, so acquisition makes eventual progress but is not FIFO.
/// Contention on a single repository is expected to be rare.
#[derive(Default)]
pub struct RepoLocks {
    held: Mutex<HashSet<String>>,
    released: Notify,
}

impl RepoLocks {
    /// Block until the lock for `key` is free, then take it. The returned
    /// guard releases the lock when dropped.
    pub async fn acquire(&self, key: &str) -> RepoLockGuard<'_> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register for the wakeup before checking, so a release between
            // the check and the await is not lost.
            notified.as_mut().enable();
            if self.held.lock().unwrap().insert(key.to_string()) {
                return RepoLockGuard {
                    locks: self,
                    key: key.to_string(),
                };
            }
            notified.await;
        }
    }
}

/// Releases the repository lock (and wakes all waiters) on drop.
pub struct RepoLockGuard<'a> {
    locks: &'a RepoLocks,
    key: String,
}

impl Drop for RepoLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().unwrap().remove(&self.key);
        self.locks.released.notify_waiters();
    }
}
