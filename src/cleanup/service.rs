//! TTL cleanup service
//!
//! A sweep walks every rule's namespace. Per key, the owning rule (first
//! match by priority) decides:
//!
//! | key state                              | action                     |
//! |----------------------------------------|----------------------------|
//! | payload `expires_at` in the past       | expired, handled by strategy |
//! | no store TTL, no logical expiry        | attach rule TTL            |
//! | store TTL longer than rule TTL         | clamp to rule TTL          |
//! | otherwise                              | leave                      |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::invalidation::{InvalidationRegistry, is_glob};
use super::rules::{CleanupRule, CleanupStrategy, sort_rules};
use crate::config::CleanupConfig;
use crate::coordination::{CoordinationStore, KeyPattern, KeyTtl};
use crate::election::LeadershipHandle;
use crate::error::Result;

const SCAN_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Keys dropped by the store's own TTL purge
    pub purged: u64,
    pub scanned: u64,
    pub expired: u64,
    pub deleted: u64,
    pub ttl_attached: u64,
    pub ttl_clamped: u64,
    /// Expired keys left for lazy deletion or the next batch cycle
    pub deferred: u64,
    pub skipped_never: u64,
    pub errors: u64,
    pub duration_ms: u64,
    /// rule name -> keys deleted
    pub per_rule: BTreeMap<String, u64>,
}

enum KeyState {
    Gone,
    Expired,
    Live,
}

/// Logical expiry carried in a JSON payload
fn logical_expiry(value: &str) -> Option<DateTime<Utc>> {
    let json: serde_json::Value = serde_json::from_str(value).ok()?;
    let raw = json.get("expires_at")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub struct CleanupService {
    store: Arc<dyn CoordinationStore>,
    rules: Vec<CleanupRule>,
    config: CleanupConfig,
    invalidation: InvalidationRegistry,
    leadership: Option<LeadershipHandle>,
}

impl CleanupService {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        mut rules: Vec<CleanupRule>,
        config: CleanupConfig,
        leadership: Option<LeadershipHandle>,
    ) -> Self {
        sort_rules(&mut rules);
        Self {
            store,
            rules,
            config,
            invalidation: InvalidationRegistry::default(),
            leadership,
        }
    }

    pub fn with_invalidation(mut self, registry: InvalidationRegistry) -> Self {
        self.invalidation = registry;
        self
    }

    pub fn rules(&self) -> &[CleanupRule] {
        &self.rules
    }

    fn owner(&self, key: &str) -> Option<&CleanupRule> {
        self.rules.iter().find(|r| r.matches(key))
    }

    /// Scheduled sweep. A no-op on followers.
    pub async fn run_cycle(&self) -> Result<CleanupStats> {
        if let Some(leadership) = &self.leadership
            && !leadership.is_leader()
        {
            debug!("Not leader, skipping cleanup cycle");
            return Ok(CleanupStats::default());
        }
        let stats = self.sweep(None, false).await?;
        info!(
            scanned = stats.scanned,
            deleted = stats.deleted,
            purged = stats.purged,
            deferred = stats.deferred,
            duration_ms = stats.duration_ms,
            "Cleanup cycle done"
        );
        Ok(stats)
    }

    /// Operator-triggered sweep, safe on any instance. Lazy and batch rules
    /// delete immediately.
    pub async fn force_cleanup(&self, pattern: Option<&str>) -> Result<CleanupStats> {
        let filter = pattern.map(KeyPattern::new).transpose()?;
        let stats = self.sweep(filter.as_ref(), true).await?;
        info!(
            pattern = pattern.unwrap_or("*"),
            scanned = stats.scanned,
            deleted = stats.deleted,
            "Forced cleanup done"
        );
        Ok(stats)
    }

    async fn sweep(&self, filter: Option<&KeyPattern>, forced: bool) -> Result<CleanupStats> {
        let started = Instant::now();
        let mut stats = CleanupStats {
            purged: self.store.purge_expired().await?,
            ..CleanupStats::default()
        };

        // Group keys by owning rule
        let mut owned: Vec<(usize, Vec<String>)> = Vec::new();
        match filter {
            Some(pattern) => {
                let keys = self.store.scan(pattern.as_str(), SCAN_LIMIT).await?;
                let mut by_rule: BTreeMap<usize, Vec<String>> = BTreeMap::new();
                for key in keys {
                    if let Some(idx) = self.rules.iter().position(|r| r.matches(&key)) {
                        by_rule.entry(idx).or_default().push(key);
                    }
                }
                owned.extend(by_rule);
            }
            None => {
                for (idx, rule) in self.rules.iter().enumerate() {
                    if rule.strategy == CleanupStrategy::Never {
                        continue;
                    }
                    let keys = self
                        .store
                        .scan(rule.pattern.as_str(), SCAN_LIMIT)
                        .await?
                        .into_iter()
                        .filter(|k| self.owner(k).is_some_and(|o| o.name == rule.name))
                        .collect();
                    owned.push((idx, keys));
                }
            }
        }

        let now = Utc::now();
        for (idx, keys) in owned {
            let rule = &self.rules[idx];
            if rule.strategy == CleanupStrategy::Never {
                stats.skipped_never += keys.len() as u64;
                continue;
            }

            let mut expired = Vec::new();
            for key in keys {
                stats.scanned += 1;
                match self.inspect(rule, &key, now, &mut stats).await {
                    Ok(KeyState::Expired) => expired.push(key),
                    Ok(KeyState::Gone | KeyState::Live) => {}
                    Err(e) => {
                        stats.errors += 1;
                        warn!(key = %key, rule = %rule.name, error = %e, "Cleanup inspect failed");
                    }
                }
            }
            stats.expired += expired.len() as u64;

            let strategy = match rule.strategy {
                CleanupStrategy::Lazy | CleanupStrategy::Batch if forced => {
                    CleanupStrategy::Immediate
                }
                s => s,
            };
            let deleted = match strategy {
                CleanupStrategy::Immediate => self.delete_all(&expired, &mut stats).await,
                CleanupStrategy::Batch => self.delete_batched(rule, &expired, &mut stats).await,
                CleanupStrategy::Lazy => {
                    stats.deferred += expired.len() as u64;
                    0
                }
                CleanupStrategy::Never => 0,
            };
            if deleted > 0 {
                debug!(rule = %rule.name, deleted, "Expired keys removed");
                *stats.per_rule.entry(rule.name.clone()).or_default() += deleted;
            }
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        Ok(stats)
    }

    async fn inspect(
        &self,
        rule: &CleanupRule,
        key: &str,
        now: DateTime<Utc>,
        stats: &mut CleanupStats,
    ) -> Result<KeyState> {
        let Some(value) = self.store.get(key).await? else {
            return Ok(KeyState::Gone);
        };
        let expiry = logical_expiry(&value);
        if expiry.is_some_and(|at| at <= now) {
            return Ok(KeyState::Expired);
        }
        match self.store.ttl(key).await? {
            KeyTtl::Missing => Ok(KeyState::Gone),
            KeyTtl::Persistent if expiry.is_none() => {
                if self.store.expire(key, rule.ttl).await? {
                    stats.ttl_attached += 1;
                }
                Ok(KeyState::Live)
            }
            KeyTtl::Expires(remaining) if remaining > rule.ttl => {
                if self.store.expire(key, rule.ttl).await? {
                    stats.ttl_clamped += 1;
                }
                Ok(KeyState::Live)
            }
            _ => Ok(KeyState::Live),
        }
    }

    async fn delete_all(&self, keys: &[String], stats: &mut CleanupStats) -> u64 {
        let mut deleted = 0;
        for key in keys {
            match self.store.delete(key).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    stats.errors += 1;
                    warn!(key = %key, error = %e, "Cleanup delete failed");
                }
            }
        }
        stats.deleted += deleted;
        deleted
    }

    async fn delete_batched(
        &self,
        rule: &CleanupRule,
        keys: &[String],
        stats: &mut CleanupStats,
    ) -> u64 {
        let mut deleted = 0;
        let mut chunks = keys.chunks(rule.batch_size.max(1));
        for chunk in chunks.by_ref().take(self.config.max_batches_per_cycle) {
            deleted += self.delete_all(chunk, stats).await;
            tokio::task::yield_now().await;
        }
        let left: usize = chunks.map(|c| c.len()).sum();
        if left > 0 {
            debug!(rule = %rule.name, left, "Batch budget used up, rest next cycle");
            stats.deferred += left as u64;
        }
        deleted
    }

    /// Read that enforces lazy expiry
    pub async fn get_checked(&self, key: &str) -> Result<Option<String>> {
        let Some(value) = self.store.get(key).await? else {
            return Ok(None);
        };
        if logical_expiry(&value).is_some_and(|at| at <= Utc::now()) {
            self.store.delete(key).await?;
            debug!(key = %key, "Expired on read");
            return Ok(None);
        }
        Ok(Some(value))
    }

    /// Drop everything derived from `key`. Returns the number of keys deleted.
    pub async fn invalidate(&self, key: &str) -> Result<u64> {
        let mut victims = HashSet::new();
        for target in self.invalidation.expand(key) {
            if is_glob(&target) {
                victims.extend(self.store.scan(&target, SCAN_LIMIT).await?);
            } else {
                victims.insert(target);
            }
        }
        victims.remove(key);

        let mut deleted = 0;
        for victim in &victims {
            if self.store.delete(victim).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            debug!(key = %key, deleted, "Invalidated derived keys");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::default_rules;
    use crate::config::SagaConfig;
    use crate::coordination::MemoryCoordinationStore;
    use std::time::Duration;

    fn service(store: Arc<MemoryCoordinationStore>) -> CleanupService {
        let config = CleanupConfig {
            max_batches_per_cycle: 2,
            ..CleanupConfig::default()
        };
        CleanupService::new(store, default_rules(&config, SagaConfig::default().record_ttl_secs).unwrap(), config, None)
    }

    fn expired_payload() -> String {
        serde_json::json!({
            "status": "completed",
            "expires_at": (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339(),
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_attach_and_clamp_ttl() {
        let store = Arc::new(MemoryCoordinationStore::new());
        store.set("cache:a", "1", None).await.unwrap();
        store
            .set("cache:b", "1", Some(Duration::from_secs(7 * 86_400)))
            .await
            .unwrap();
        store.set("leader_election:svc:leader", "{}", None).await.unwrap();

        let stats = service(store.clone()).run_cycle().await.unwrap();
        assert_eq!(stats.ttl_attached, 1);
        assert_eq!(stats.ttl_clamped, 1);
        for key in ["cache:a", "cache:b"] {
            match store.ttl(key).await.unwrap() {
                KeyTtl::Expires(d) => assert!(d <= Duration::from_secs(3_600)),
                other => panic!("{} has {:?}", key, other),
            }
        }
        // Election keys are never touched
        assert_eq!(
            store.ttl("leader_election:svc:leader").await.unwrap(),
            KeyTtl::Persistent
        );
    }

    #[tokio::test]
    async fn test_logically_expired_keys_by_strategy() {
        let store = Arc::new(MemoryCoordinationStore::new());
        store.set("idempotency:k1", &expired_payload(), None).await.unwrap();
        store.set("session:s1", &expired_payload(), None).await.unwrap();
        store.set("cache:x", &expired_payload(), None).await.unwrap();

        let svc = service(store.clone());
        let stats = svc.run_cycle().await.unwrap();
        assert_eq!(stats.expired, 3);
        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.deferred, 1);
        assert!(store.get("session:s1").await.unwrap().is_some());

        // Lazy key goes on read
        assert!(svc.get_checked("session:s1").await.unwrap().is_none());
        assert!(store.get("session:s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_budget_defers_rest() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let rule = CleanupRule::new("tmp", "tmp:*", Duration::from_secs(60), CleanupStrategy::Batch)
            .unwrap()
            .with_batch_size(2);
        let config = CleanupConfig {
            max_batches_per_cycle: 2,
            ..CleanupConfig::default()
        };
        let svc = CleanupService::new(store.clone(), vec![rule], config, None);
        for i in 0..7 {
            store.set(&format!("tmp:{}", i), &expired_payload(), None).await.unwrap();
        }

        let stats = svc.run_cycle().await.unwrap();
        assert_eq!(stats.deleted, 4);
        assert_eq!(stats.deferred, 3);

        let forced = svc.force_cleanup(Some("tmp:*")).await.unwrap();
        assert_eq!(forced.deleted, 3);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_follower_skips_cycle() {
        let store = Arc::new(MemoryCoordinationStore::new());
        store.set("cache:x", &expired_payload(), None).await.unwrap();
        let config = CleanupConfig::default();
        let svc = CleanupService::new(
            store.clone(),
            default_rules(&config, SagaConfig::default().record_ttl_secs).unwrap(),
            config,
            Some(LeadershipHandle::default()),
        );

        assert_eq!(svc.run_cycle().await.unwrap(), CleanupStats::default());
        assert_eq!(store.len(), 1);
        // Operators can still force it
        assert_eq!(svc.force_cleanup(None).await.unwrap().deleted, 1);
    }

    #[tokio::test]
    async fn test_invalidate_balance_caches() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let mut registry = InvalidationRegistry::with_defaults().unwrap();
        registry.add_dependency("balance:u1", "cache:portfolio:u1");
        let svc = service(store.clone()).with_invalidation(registry);

        for key in [
            "balance:u1",
            "cache:balance:u1:USD",
            "cache:balance:u1:EUR",
            "cache:balance:u2:USD",
            "cache:portfolio:u1",
        ] {
            store.set(key, "v", None).await.unwrap();
        }

        assert_eq!(svc.invalidate("balance:u1").await.unwrap(), 3);
        assert!(store.get("balance:u1").await.unwrap().is_some());
        assert!(store.get("cache:balance:u2:USD").await.unwrap().is_some());
    }
}
