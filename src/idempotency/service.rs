//! Idempotency Service
//!
//! Front door for "at most one execution" of an operation. Backend choice per
//! call:
//!
//! ```text
//! primary reachable              -> primary
//! primary down, fallback enabled -> relational fallback
//! otherwise                      -> CoordinationUnsafe (nothing is written)
//! ```
//!
//! A key claimed on the fallback during an outage stays on the fallback until
//! its record expires, so a recovered primary never claims it a second time.
//!
//! A claim that cannot be coordinated is never reported as claimed.

use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::store::IdempotencyStore;
use super::types::{ClaimOutcome, ClaimPolicy, ClaimRequest, Finish, IdempotencyRecord};
use crate::config::IdempotencyConfig;
use crate::error::{CoreError, Result};

/// Result of [`IdempotencyService::run_idempotent`]
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotentOutcome<T> {
    /// The closure ran under this call's claim
    Executed(T),
    /// An earlier call completed; its stored result is returned
    Cached(Option<Value>),
}

pub struct IdempotencyService {
    primary: Arc<dyn IdempotencyStore>,
    fallback: Option<Arc<dyn IdempotencyStore>>,
    config: IdempotencyConfig,
    instance_id: String,
}

impl IdempotencyService {
    pub fn new(
        primary: Arc<dyn IdempotencyStore>,
        fallback: Option<Arc<dyn IdempotencyStore>>,
        config: IdempotencyConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            primary,
            fallback,
            config,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    fn fallback(&self) -> Option<&Arc<dyn IdempotencyStore>> {
        self.fallback.as_ref().filter(|_| self.config.fallback_enabled)
    }

    /// True if some backend can currently coordinate
    pub async fn coordination_is_safe(&self) -> bool {
        if self.primary.is_available().await {
            return true;
        }
        match self.fallback() {
            Some(fb) => fb.is_available().await,
            None => false,
        }
    }

    async fn select_backend(&self, key: &str) -> Result<&Arc<dyn IdempotencyStore>> {
        if self.primary.is_available().await {
            return Ok(&self.primary);
        }
        if let Some(fb) = self.fallback() {
            if fb.is_available().await {
                tracing::warn!(
                    key = %key,
                    backend = fb.backend(),
                    "Coordination store unavailable, using idempotency fallback"
                );
                return Ok(fb);
            }
        }
        tracing::error!(
            key = %key,
            fallback_enabled = self.config.fallback_enabled,
            "No idempotency backend available, refusing operation"
        );
        Err(CoreError::CoordinationUnsafe(format!(
            "no idempotency backend available for key {}",
            key
        )))
    }

    /// Backend that owns `key` for a claim.
    ///
    /// While the primary is up, a live record left on the fallback by an
    /// earlier outage still decides the outcome.
    async fn claim_backend(&self, key: &str) -> Result<&Arc<dyn IdempotencyStore>> {
        let backend = self.select_backend(key).await?;
        if !Arc::ptr_eq(backend, &self.primary) {
            return Ok(backend);
        }
        if let Some(fb) = self.fallback()
            && fb.is_available().await
            && let Some(record) = fb.get(key).await?
            && !record.is_expired(Utc::now())
        {
            tracing::info!(
                key = %key,
                status = %record.status,
                backend = fb.backend(),
                "Idempotency key owned by fallback record"
            );
            return Ok(fb);
        }
        Ok(backend)
    }

    fn policy(&self, req: &ClaimRequest) -> ClaimPolicy {
        ClaimPolicy {
            ttl: req
                .ttl
                .unwrap_or(Duration::from_secs(self.config.default_ttl_secs)),
            processing_timeout: req
                .processing_timeout
                .unwrap_or(Duration::from_secs(self.config.processing_timeout_secs)),
            max_retries: req.max_retries.unwrap_or(self.config.max_retries),
        }
    }

    /// Claim an operation key
    pub async fn claim(&self, req: ClaimRequest) -> Result<ClaimOutcome> {
        let backend = self.claim_backend(&req.key).await?;
        let policy = self.policy(&req);
        let outcome = backend.try_claim(&req, &policy, &self.instance_id).await?;

        match &outcome {
            ClaimOutcome::Claimed { record, reclaimed } => tracing::debug!(
                key = %req.key,
                operation_type = %req.operation_type,
                backend = backend.backend(),
                reclaimed = *reclaimed,
                retry_count = record.retry_count,
                "Idempotency key claimed"
            ),
            ClaimOutcome::HashMismatch { .. } => tracing::warn!(
                key = %req.key,
                operation_type = %req.operation_type,
                "Idempotency key reused with a different payload"
            ),
            other => tracing::debug!(
                key = %req.key,
                existing = ?other.existing_status(),
                "Idempotency key already present"
            ),
        }
        Ok(outcome)
    }

    /// Mark a claimed key completed, caching `result`
    pub async fn complete(&self, key: &str, result: Option<Value>) -> Result<IdempotencyRecord> {
        let ttl = Duration::from_secs(self.config.result_ttl_secs);
        self.finish(key, Finish::Completed(result), ttl).await
    }

    /// Mark a claimed key failed; it may be reclaimed while retries remain
    pub async fn fail(&self, key: &str, error: &str) -> Result<IdempotencyRecord> {
        let ttl = Duration::from_secs(self.config.default_ttl_secs);
        self.finish(key, Finish::Failed(error.to_string()), ttl)
            .await
    }

    async fn finish(&self, key: &str, finish: Finish, ttl: Duration) -> Result<IdempotencyRecord> {
        let backend = self.select_backend(key).await?;
        match backend.finish(key, finish.clone(), ttl).await {
            // Claimed on the fallback during an outage that has since ended
            Err(CoreError::NotProcessing { status, .. }) if status == "missing" => {
                match self.fallback().filter(|fb| !Arc::ptr_eq(fb, backend)) {
                    Some(fb) => fb.finish(key, finish, ttl).await,
                    None => Err(CoreError::NotProcessing {
                        key: key.to_string(),
                        status,
                    }),
                }
            }
            other => other,
        }
    }

    /// Look a record up on the primary, then the fallback
    pub async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        if self.primary.is_available().await {
            if let Some(record) = self.primary.get(key).await? {
                return Ok(Some(record));
            }
        }
        match self.fallback() {
            Some(fb) if fb.is_available().await => fb.get(key).await,
            _ => Ok(None),
        }
    }

    /// Sweep expired records from every reachable backend
    pub async fn purge_expired(&self) -> Result<u64> {
        let mut purged = 0;
        if self.primary.is_available().await {
            purged += self.primary.purge_expired().await?;
        }
        if let Some(fb) = self.fallback()
            && fb.is_available().await
        {
            purged += fb.purge_expired().await?;
        }
        if purged > 0 {
            tracing::info!(purged, "Expired idempotency records purged");
        }
        Ok(purged)
    }

    /// Claim `req`, run `f` on success and record its outcome.
    ///
    /// A completed key returns `Cached` without running `f`. A key held by
    /// another caller yields `AlreadyProcessing`; a different payload under
    /// the same key yields `IdempotencyHashMismatch`.
    pub async fn run_idempotent<T, F, Fut>(
        &self,
        req: ClaimRequest,
        f: F,
    ) -> Result<IdempotentOutcome<T>>
    where
        T: serde::Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = req.key.clone();
        match self.claim(req).await? {
            ClaimOutcome::Claimed { .. } => {}
            ClaimOutcome::Completed { result } => return Ok(IdempotentOutcome::Cached(result)),
            ClaimOutcome::AlreadyProcessing { .. } => {
                return Err(CoreError::AlreadyProcessing { key });
            }
            ClaimOutcome::HashMismatch { .. } => {
                return Err(CoreError::IdempotencyHashMismatch { key });
            }
            ClaimOutcome::Failed { error, .. } => {
                return Err(CoreError::NotProcessing {
                    key,
                    status: format!("failed: {}", error.unwrap_or_default()),
                });
            }
        }

        match f().await {
            Ok(value) => {
                let stored = serde_json::to_value(&value)?;
                self.complete(&key, Some(stored)).await?;
                Ok(IdempotentOutcome::Executed(value))
            }
            Err(e) => {
                if let Err(mark_err) = self.fail(&key, &e.to_string()).await {
                    tracing::error!(
                        key = %key,
                        error = %mark_err,
                        "Failed to record idempotent operation failure"
                    );
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordinationStore, MemoryCoordinationStore};
    use crate::idempotency::store::CoordinationIdempotencyStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn service_with(
        primary: Arc<MemoryCoordinationStore>,
        fallback: Option<Arc<MemoryCoordinationStore>>,
    ) -> IdempotencyService {
        let config = IdempotencyConfig {
            fallback_enabled: fallback.is_some(),
            ..IdempotencyConfig::default()
        };
        IdempotencyService::new(
            Arc::new(CoordinationIdempotencyStore::new(primary)),
            fallback.map(|fb| {
                Arc::new(CoordinationIdempotencyStore::new(fb)) as Arc<dyn IdempotencyStore>
            }),
            config,
            "test-instance",
        )
    }

    #[tokio::test]
    async fn test_fail_closed_writes_nothing() {
        let primary = Arc::new(MemoryCoordinationStore::new());
        primary.set_available(false);
        let service = service_with(primary.clone(), None);

        assert!(!service.coordination_is_safe().await);
        let err = service
            .claim(ClaimRequest::new("k", "withdraw", "h"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "COORDINATION_UNSAFE");

        primary.set_available(true);
        assert!(primary.get("idempotency:k").await.unwrap().is_none());
        assert_eq!(primary.write_count(), 0);
    }

    #[tokio::test]
    async fn test_fallback_used_when_primary_down() {
        let primary = Arc::new(MemoryCoordinationStore::new());
        let fallback = Arc::new(MemoryCoordinationStore::new());
        primary.set_available(false);
        let service = service_with(primary.clone(), Some(fallback.clone()));

        assert!(service.coordination_is_safe().await);
        let outcome = service
            .claim(ClaimRequest::new("k", "withdraw", "h"))
            .await
            .unwrap();
        assert!(outcome.claimed());
        assert!(fallback.get("idempotency:k").await.unwrap().is_some());

        // Primary recovers before completion; finish still lands on the fallback
        primary.set_available(true);
        let done = service.complete("k", None).await.unwrap();
        assert_eq!(done.status, crate::idempotency::IdempotencyStatus::Completed);
    }

    #[tokio::test]
    async fn test_fallback_record_survives_primary_recovery() {
        let primary = Arc::new(MemoryCoordinationStore::new());
        let fallback = Arc::new(MemoryCoordinationStore::new());
        let service = service_with(primary.clone(), Some(fallback.clone()));

        primary.set_available(false);
        assert!(service
            .claim(ClaimRequest::new("pay", "payout", "h"))
            .await
            .unwrap()
            .claimed());
        service
            .complete("pay", Some(serde_json::json!({"tx": 1})))
            .await
            .unwrap();
        assert!(service
            .claim(ClaimRequest::new("held", "payout", "h"))
            .await
            .unwrap()
            .claimed());

        primary.set_available(true);
        match service
            .claim(ClaimRequest::new("pay", "payout", "h"))
            .await
            .unwrap()
        {
            ClaimOutcome::Completed { result } => {
                assert_eq!(result, Some(serde_json::json!({"tx": 1})))
            }
            other => panic!("expected cached completion, got {:?}", other),
        }
        let held = service
            .claim(ClaimRequest::new("held", "payout", "h"))
            .await
            .unwrap();
        assert!(matches!(held, ClaimOutcome::AlreadyProcessing { .. }));
        let mismatch = service
            .claim(ClaimRequest::new("pay", "payout", "other"))
            .await
            .unwrap();
        assert!(matches!(mismatch, ClaimOutcome::HashMismatch { .. }));

        assert!(primary.get("idempotency:pay").await.unwrap().is_none());
        assert!(primary.get("idempotency:held").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_idempotent_executes_once() {
        let service = service_with(Arc::new(MemoryCoordinationStore::new()), None);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let outcome = service
                .run_idempotent(ClaimRequest::new("pay-1", "payment", "h"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!({"tx": "0x1"}))
                })
                .await
                .unwrap();
            if let IdempotentOutcome::Cached(result) = outcome {
                assert_eq!(result, Some(serde_json::json!({"tx": "0x1"})));
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_idempotent_records_failure_and_mismatch() {
        let service = service_with(Arc::new(MemoryCoordinationStore::new()), None);

        let err = service
            .run_idempotent(ClaimRequest::new("pay-2", "payment", "h"), || async {
                Err::<(), _>(CoreError::BusinessRuleViolation("insufficient funds".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BUSINESS_RULE_VIOLATION");

        let record = service.get("pay-2").await.unwrap().unwrap();
        assert_eq!(record.status, crate::idempotency::IdempotencyStatus::Failed);

        let err = service
            .run_idempotent(ClaimRequest::new("pay-2", "payment", "other"), || async {
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IDEMPOTENCY_HASH_MISMATCH");
    }

    #[tokio::test]
    async fn test_complete_without_claim_is_rejected() {
        let service = service_with(Arc::new(MemoryCoordinationStore::new()), None);
        let err = service.complete("never-claimed", None).await.unwrap_err();
        assert_eq!(err.code(), "NOT_PROCESSING");
    }
}
