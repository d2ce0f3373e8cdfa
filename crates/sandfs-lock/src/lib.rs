//! # sandfs-lock
//!
//! Per-resource access serialization for sandfs.
//!
//! The backend allows at most one exclusive random-access session per blob;
//! a second concurrent open is a hard error. Every operation that opens a
//! session on a shared blob (the pack blob, the link table) therefore runs
//! under a keyed lock from this registry. Keys are per resource, so the
//! pack blob and the link table never contend with each other.
//!
//! Waiters are handed the lock in arrival order - tokio's mutex queues
//! fairly, which is what keeps a burst of batch writes from starving any
//! one of them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Guard holding exclusive access to one resource key.
///
/// The resource is released when the guard drops, including on error paths.
pub type ResourceGuard = OwnedMutexGuard<()>;

/// Keyed FIFO mutual exclusion over logical resources.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting behind earlier arrivals.
    pub async fn acquire(&self, key: &str) -> ResourceGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        trace!(resource = key, "waiting for resource lock");
        let guard = lock.lock_owned().await;
        trace!(resource = key, "resource lock acquired");
        guard
    }

    /// Run `operation` while holding the lock for `key`.
    pub async fn with_lock<T, F>(&self, key: &str, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire(key).await;
        operation.await
    }
}
