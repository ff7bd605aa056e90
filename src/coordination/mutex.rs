//! Distributed mutex on top of the coordination store
//!
//! Acquire = `set_if_absent(lock:<name>, token, ttl)`; release =
//! `compare_and_delete(lock:<name>, token)`, so a holder whose lease already
//! expired can never release somebody else's lock.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use super::{CoordinationStore, lock_key};
use crate::error::Result;

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

pub struct DistributedMutex {
    store: Arc<dyn CoordinationStore>,
    name: String,
    lease: Duration,
}

/// Held lock. Release explicitly; dropping only lets the lease run out.
#[derive(Debug)]
pub struct MutexGuard {
    key: String,
    token: String,
}

impl MutexGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl DistributedMutex {
    pub fn new(store: Arc<dyn CoordinationStore>, name: impl Into<String>, lease: Duration) -> Self {
        Self {
            store,
            name: name.into(),
            lease,
        }
    }

    /// Single attempt
    pub async fn try_acquire(&self) -> Result<Option<MutexGuard>> {
        let key = lock_key(&self.name);
        let token = ulid::Ulid::new().to_string();
        if self
            .store
            .set_if_absent(&key, &token, Some(self.lease))
            .await?
        {
            debug!(lock = %key, "Mutex acquired");
            Ok(Some(MutexGuard { key, token }))
        } else {
            Ok(None)
        }
    }

    /// Retry until acquired or `wait` elapses
    pub async fn acquire(&self, wait: Duration) -> Result<Option<MutexGuard>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_acquire().await? {
                return Ok(Some(guard));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(RETRY_INTERVAL).await;
        }
    }

    /// Returns false if the lease had already expired or been taken over
    pub async fn release(&self, guard: MutexGuard) -> Result<bool> {
        let released = self
            .store
            .compare_and_delete(&guard.key, &guard.token)
            .await?;
        if !released {
            warn!(lock = %guard.key, "Mutex lease lost before release");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinationStore::new());
        let a = DistributedMutex::new(store.clone(), "cleanup", Duration::from_secs(5));
        let b = DistributedMutex::new(store.clone(), "cleanup", Duration::from_secs(5));

        let guard = a.try_acquire().await.unwrap().unwrap();
        assert!(b.try_acquire().await.unwrap().is_none());
        assert!(a.release(guard).await.unwrap());
        assert!(b.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_holder_cannot_release_new_owner() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinationStore::new());
        let a = DistributedMutex::new(store.clone(), "m", Duration::from_millis(10));
        let b = DistributedMutex::new(store.clone(), "m", Duration::from_secs(5));

        let stale = a.try_acquire().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = b.acquire(Duration::from_millis(100)).await.unwrap().unwrap();

        assert!(!a.release(stale).await.unwrap());
        assert_eq!(
            store.get("lock:m").await.unwrap().as_deref(),
            Some(fresh.token())
        );
    }
}
