//! In-process coordination store
//!
//! Backed by a `DashMap`; conditional writes go through the map's entry API so
//! they are atomic with respect to other tasks in the same process. Useful for
//! single-instance deployments and tests. `set_available(false)` simulates an
//! outage: every call then fails with `StoreUnavailable`.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::pattern::KeyPattern;
use super::{CoordinationStore, KeyTtl};
use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

pub struct MemoryCoordinationStore {
    entries: DashMap<String, StoredValue>,
    available: AtomicBool,
    /// Number of calls served, for tests asserting "no writes happened"
    writes: AtomicU64,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Toggle simulated reachability
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Successful mutating calls so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Live key count
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::StoreUnavailable(
                "memory coordination store marked unavailable".to_string(),
            ))
        }
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        self.wrote();
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let written = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut o) => {
                if o.get().is_live(now) {
                    false
                } else {
                    o.insert(StoredValue::new(value, ttl));
                    true
                }
            }
            Entry::Vacant(v) => {
                v.insert(StoredValue::new(value, ttl));
                true
            }
        };
        if written {
            self.wrote();
        }
        Ok(written)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let swapped = match self.entries.get_mut(key) {
            Some(mut e) if e.is_live(now) && e.value == expected => {
                *e = StoredValue::new(value, ttl);
                true
            }
            _ => false,
        };
        if swapped {
            self.wrote();
        }
        Ok(swapped)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let removed = self
            .entries
            .remove(key)
            .is_some_and(|(_, v)| v.is_live(now));
        if removed {
            self.wrote();
        }
        Ok(removed)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, v| v.is_live(now) && v.value == expected)
            .is_some();
        if removed {
            self.wrote();
        }
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut e) if e.is_live(now) => {
                e.expires_at = Some(now + ttl);
                self.wrote();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.check()?;
        let now = Instant::now();
        Ok(match self.entries.get(key) {
            Some(e) if e.is_live(now) => match e.expires_at {
                None => KeyTtl::Persistent,
                Some(at) => KeyTtl::Expires(at.saturating_duration_since(now)),
            },
            _ => KeyTtl::Missing,
        })
    }

    async fn scan(&self, pattern: &str, limit: usize) -> Result<Vec<String>> {
        self.check()?;
        let pattern = KeyPattern::new(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_live(now) && pattern.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.check()?;
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| v.is_live(now));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_if_absent_first_writer_wins() {
        let store = MemoryCoordinationStore::new();
        assert!(store.set_if_absent("k", "a", None).await.unwrap());
        assert!(!store.set_if_absent("k", "b", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_concurrent_set_if_absent() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let mut handles = vec![];
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .set_if_absent("race", &i.to_string(), None)
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_expired_key_is_invisible_and_reclaimable() {
        let store = MemoryCoordinationStore::new();
        store
            .set("k", "old", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Missing);
        assert!(store.set_if_absent("k", "new", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_compare_and_set_and_delete() {
        let store = MemoryCoordinationStore::new();
        store.set("k", "v1", None).await.unwrap();
        assert!(!store.compare_and_set("k", "nope", "v2", None).await.unwrap());
        assert!(store.compare_and_set("k", "v1", "v2", None).await.unwrap());
        assert!(!store.compare_and_delete("k", "v1").await.unwrap());
        assert!(store.compare_and_delete("k", "v2").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_and_expire() {
        let store = MemoryCoordinationStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Persistent);
        assert!(store.expire("k", Duration::from_secs(60)).await.unwrap());
        match store.ttl("k").await.unwrap() {
            KeyTtl::Expires(d) => assert!(d <= Duration::from_secs(60)),
            other => panic!("unexpected ttl {:?}", other),
        }
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_sorted_and_limited() {
        let store = MemoryCoordinationStore::new();
        for k in ["saga:3", "saga:1", "saga:2", "cache:x"] {
            store.set(k, "v", None).await.unwrap();
        }
        let keys = store.scan("saga:*", 2).await.unwrap();
        assert_eq!(keys, vec!["saga:1".to_string(), "saga:2".to_string()]);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryCoordinationStore::new();
        store
            .set("a", "v", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        store.set("b", "v", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_everything() {
        let store = MemoryCoordinationStore::new();
        store.set_available(false);
        assert!(matches!(
            store.ping().await,
            Err(CoreError::StoreUnavailable(_))
        ));
        assert!(store.set_if_absent("k", "v", None).await.is_err());
        assert_eq!(store.write_count(), 0);
    }
}
