//! Idempotency record stores
//!
//! [`IdempotencyStore`] is the seam between the service and its two
//! backends. The coordination-backed store is primary; the relational store
//! in `postgres.rs` is the fallback. Both apply the same decision table
//! ([`evaluate_existing`]) so callers see identical outcomes.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::types::{
    ClaimDecision, ClaimOutcome, ClaimPolicy, ClaimRequest, Finish, IdempotencyRecord,
    IdempotencyStatus, evaluate_existing,
};
use crate::coordination::{CoordinationStore, idempotency_key};
use crate::error::{CoreError, Result};

/// Conditional-write attempts before giving up on a contended key
const CAS_ATTEMPTS: usize = 3;

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Cheap reachability check
    async fn is_available(&self) -> bool;

    /// Atomically create a `processing` record or report the existing one
    async fn try_claim(
        &self,
        req: &ClaimRequest,
        policy: &ClaimPolicy,
        instance_id: &str,
    ) -> Result<ClaimOutcome>;

    /// Move a `processing` record to `completed` / `failed`.
    ///
    /// Fails with `NotProcessing` for any other status, including a missing
    /// record.
    async fn finish(&self, key: &str, finish: Finish, ttl: Duration) -> Result<IdempotencyRecord>;

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Drop expired records. Returns the number removed.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Primary store: records are JSON values under `idempotency:<key>`
pub struct CoordinationIdempotencyStore {
    store: Arc<dyn CoordinationStore>,
}

impl CoordinationIdempotencyStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    fn decode(raw: &str) -> Result<IdempotencyRecord> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[async_trait]
impl IdempotencyStore for CoordinationIdempotencyStore {
    fn backend(&self) -> &'static str {
        self.store.name()
    }

    async fn is_available(&self) -> bool {
        self.store.ping().await.is_ok()
    }

    async fn try_claim(
        &self,
        req: &ClaimRequest,
        policy: &ClaimPolicy,
        instance_id: &str,
    ) -> Result<ClaimOutcome> {
        let skey = idempotency_key(&req.key);

        for _ in 0..CAS_ATTEMPTS {
            let now = Utc::now();
            let fresh = IdempotencyRecord::processing(req, policy, instance_id, now);
            let encoded = serde_json::to_string(&fresh)?;
            if self
                .store
                .set_if_absent(&skey, &encoded, Some(policy.ttl))
                .await?
            {
                return Ok(ClaimOutcome::Claimed {
                    record: fresh,
                    reclaimed: false,
                });
            }

            // Expired between the two calls; try the insert again
            let Some(raw) = self.store.get(&skey).await? else {
                continue;
            };
            let existing = Self::decode(&raw)?;
            match evaluate_existing(&existing, req, policy, instance_id, now) {
                ClaimDecision::Outcome(outcome) => return Ok(outcome),
                ClaimDecision::Reclaim(record) => {
                    let encoded = serde_json::to_string(&record)?;
                    if self
                        .store
                        .compare_and_set(&skey, &raw, &encoded, Some(policy.ttl))
                        .await?
                    {
                        tracing::info!(
                            key = %req.key,
                            retry_count = record.retry_count,
                            previous_status = %existing.status,
                            "Idempotency record reclaimed"
                        );
                        return Ok(ClaimOutcome::Claimed {
                            record,
                            reclaimed: true,
                        });
                    }
                }
            }
        }

        // Lost every race: someone else is actively working the key
        Ok(ClaimOutcome::AlreadyProcessing {
            instance_id: None,
            started_at: None,
        })
    }

    async fn finish(&self, key: &str, finish: Finish, ttl: Duration) -> Result<IdempotencyRecord> {
        let skey = idempotency_key(key);
        let mut last_status = "missing".to_string();

        for _ in 0..CAS_ATTEMPTS {
            let Some(raw) = self.store.get(&skey).await? else {
                return Err(CoreError::NotProcessing {
                    key: key.to_string(),
                    status: "missing".to_string(),
                });
            };
            let record = Self::decode(&raw)?;
            if record.status != IdempotencyStatus::Processing {
                return Err(CoreError::NotProcessing {
                    key: key.to_string(),
                    status: record.status.to_string(),
                });
            }
            last_status = record.status.to_string();

            let updated = record.finished(&finish, ttl, Utc::now());
            let encoded = serde_json::to_string(&updated)?;
            if self
                .store
                .compare_and_set(&skey, &raw, &encoded, Some(ttl))
                .await?
            {
                return Ok(updated);
            }
        }

        Err(CoreError::NotProcessing {
            key: key.to_string(),
            status: last_status,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.store
            .get(&idempotency_key(key))
            .await?
            .map(|raw| Self::decode(&raw))
            .transpose()
    }

    async fn purge_expired(&self) -> Result<u64> {
        // TTL expiry covers the key space; purge is only a physical sweep
        self.store.purge_expired().await
    }
}
