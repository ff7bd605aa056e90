//! Idempotency Core Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Idempotency record status
///
/// A record is written directly as `Processing` by a successful claim; only
/// `Processing` may move to `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::Processing => "processing",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
            IdempotencyStatus::Expired => "expired",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IdempotencyStatus::Pending),
            "processing" => Some(IdempotencyStatus::Processing),
            "completed" => Some(IdempotencyStatus::Completed),
            "failed" => Some(IdempotencyStatus::Failed),
            "expired" => Some(IdempotencyStatus::Expired),
            _ => None,
        }
    }

    /// Tri-state `success` column of the relational fallback
    pub fn success_flag(&self) -> Option<bool> {
        match self {
            IdempotencyStatus::Completed => Some(true),
            IdempotencyStatus::Failed => Some(false),
            _ => None,
        }
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One deduplicated operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub operation_type: String,
    pub user_id: Option<String>,
    /// Fixed at creation, never overwritten
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub instance_id: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Fresh `processing` record for a first claim
    pub fn processing(
        req: &ClaimRequest,
        policy: &ClaimPolicy,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: req.key.clone(),
            operation_type: req.operation_type.clone(),
            user_id: req.user_id.clone(),
            request_hash: req.request_hash.clone(),
            status: IdempotencyStatus::Processing,
            result: None,
            error: None,
            retry_count: 0,
            instance_id: Some(instance_id.to_string()),
            processing_started_at: Some(now),
            created_at: now,
            updated_at: now,
            expires_at: now + to_chrono(policy.ttl),
        }
    }

    /// Same record taken over for another attempt
    pub fn reclaimed(&self, policy: &ClaimPolicy, instance_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            status: IdempotencyStatus::Processing,
            error: None,
            retry_count: self.retry_count + 1,
            instance_id: Some(instance_id.to_string()),
            processing_started_at: Some(now),
            updated_at: now,
            expires_at: now + to_chrono(policy.ttl),
            ..self.clone()
        }
    }

    /// Terminal copy after complete/fail
    pub fn finished(&self, finish: &Finish, ttl: Duration, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        match finish {
            Finish::Completed(result) => {
                next.status = IdempotencyStatus::Completed;
                next.result = result.clone();
                next.error = None;
            }
            Finish::Failed(error) => {
                next.status = IdempotencyStatus::Failed;
                next.error = Some(error.clone());
            }
        }
        next.updated_at = now;
        next.expires_at = now + to_chrono(ttl);
        next
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Status as observed at `now`
    pub fn effective_status(&self, now: DateTime<Utc>) -> IdempotencyStatus {
        if self.is_expired(now) {
            IdempotencyStatus::Expired
        } else {
            self.status
        }
    }
}

/// Terminal outcome written by `complete` / `fail`
#[derive(Debug, Clone, PartialEq)]
pub enum Finish {
    Completed(Option<Value>),
    Failed(String),
}

/// A claim request
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRequest {
    pub key: String,
    pub operation_type: String,
    pub user_id: Option<String>,
    pub request_hash: String,
    /// Overrides the service default TTL
    pub ttl: Option<Duration>,
    /// Overrides the service default processing timeout
    pub processing_timeout: Option<Duration>,
    /// Overrides the service default retry bound
    pub max_retries: Option<u32>,
}

impl ClaimRequest {
    pub fn new(
        key: impl Into<String>,
        operation_type: impl Into<String>,
        request_hash: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            operation_type: operation_type.into(),
            user_id: None,
            request_hash: request_hash.into(),
            ttl: None,
            processing_timeout: None,
            max_retries: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Resolved limits for one claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    pub ttl: Duration,
    pub processing_timeout: Duration,
    pub max_retries: u32,
}

/// Result of a claim
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Caller owns the operation and must `complete` or `fail` it
    Claimed {
        record: IdempotencyRecord,
        /// True if a failed or stuck record was taken over
        reclaimed: bool,
    },
    /// Finished earlier; replay the cached result
    Completed { result: Option<Value> },
    /// Another caller holds the claim
    AlreadyProcessing {
        instance_id: Option<String>,
        started_at: Option<DateTime<Utc>>,
    },
    /// Same key, different payload. Never resolved automatically.
    HashMismatch { stored_hash: String },
    /// Failed and out of retries
    Failed {
        error: Option<String>,
        retry_count: u32,
    },
}

impl ClaimOutcome {
    pub fn claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed { .. })
    }

    /// Status of the record that blocked the claim, if any
    pub fn existing_status(&self) -> Option<IdempotencyStatus> {
        match self {
            ClaimOutcome::Claimed { reclaimed: true, .. } => Some(IdempotencyStatus::Failed),
            ClaimOutcome::Claimed { .. } => None,
            ClaimOutcome::Completed { .. } => Some(IdempotencyStatus::Completed),
            ClaimOutcome::AlreadyProcessing { .. } => Some(IdempotencyStatus::Processing),
            ClaimOutcome::HashMismatch { .. } => None,
            ClaimOutcome::Failed { .. } => Some(IdempotencyStatus::Failed),
        }
    }
}

/// What a store should do about an existing record
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ClaimDecision {
    Outcome(ClaimOutcome),
    Reclaim(IdempotencyRecord),
}

/// Shared decision table for both backends
pub(crate) fn evaluate_existing(
    existing: &IdempotencyRecord,
    req: &ClaimRequest,
    policy: &ClaimPolicy,
    instance_id: &str,
    now: DateTime<Utc>,
) -> ClaimDecision {
    if existing.is_expired(now) {
        return ClaimDecision::Reclaim(IdempotencyRecord::processing(
            req,
            policy,
            instance_id,
            now,
        ));
    }

    if existing.request_hash != req.request_hash {
        return ClaimDecision::Outcome(ClaimOutcome::HashMismatch {
            stored_hash: existing.request_hash.clone(),
        });
    }

    let exhausted = existing.retry_count >= policy.max_retries;
    match existing.status {
        IdempotencyStatus::Completed => ClaimDecision::Outcome(ClaimOutcome::Completed {
            result: existing.result.clone(),
        }),
        IdempotencyStatus::Processing => {
            let stuck = existing
                .processing_started_at
                .is_none_or(|started| started + to_chrono(policy.processing_timeout) <= now);
            if !stuck {
                ClaimDecision::Outcome(ClaimOutcome::AlreadyProcessing {
                    instance_id: existing.instance_id.clone(),
                    started_at: existing.processing_started_at,
                })
            } else if exhausted {
                ClaimDecision::Outcome(ClaimOutcome::Failed {
                    error: Some("processing timed out".to_string()),
                    retry_count: existing.retry_count,
                })
            } else {
                ClaimDecision::Reclaim(existing.reclaimed(policy, instance_id, now))
            }
        }
        IdempotencyStatus::Failed => {
            if exhausted {
                ClaimDecision::Outcome(ClaimOutcome::Failed {
                    error: existing.error.clone(),
                    retry_count: existing.retry_count,
                })
            } else {
                ClaimDecision::Reclaim(existing.reclaimed(policy, instance_id, now))
            }
        }
        IdempotencyStatus::Pending | IdempotencyStatus::Expired => {
            ClaimDecision::Reclaim(existing.reclaimed(policy, instance_id, now))
        }
    }
}

/// std -> chrono duration, saturating
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ClaimPolicy {
        ClaimPolicy {
            ttl: Duration::from_secs(60),
            processing_timeout: Duration::from_secs(30),
            max_retries: 2,
        }
    }

    fn request(hash: &str) -> ClaimRequest {
        ClaimRequest::new("cashout:7:abc", "cashout", hash).with_user("7")
    }

    #[test]
    fn test_status_strings() {
        for status in [
            IdempotencyStatus::Pending,
            IdempotencyStatus::Processing,
            IdempotencyStatus::Completed,
            IdempotencyStatus::Failed,
            IdempotencyStatus::Expired,
        ] {
            assert_eq!(IdempotencyStatus::from_str_opt(status.as_str()), Some(status));
        }
        assert_eq!(IdempotencyStatus::Completed.success_flag(), Some(true));
        assert_eq!(IdempotencyStatus::Processing.success_flag(), None);
    }

    #[test]
    fn test_hash_mismatch_wins_over_status() {
        let now = Utc::now();
        let existing = IdempotencyRecord::processing(&request("h1"), &policy(), "i1", now);
        let decision = evaluate_existing(&existing, &request("h2"), &policy(), "i2", now);
        assert_eq!(
            decision,
            ClaimDecision::Outcome(ClaimOutcome::HashMismatch {
                stored_hash: "h1".to_string()
            })
        );
    }

    #[test]
    fn test_processing_is_blocking_until_stuck() {
        let now = Utc::now();
        let existing = IdempotencyRecord::processing(&request("h"), &policy(), "i1", now);

        let fresh = evaluate_existing(&existing, &request("h"), &policy(), "i2", now);
        assert!(matches!(
            fresh,
            ClaimDecision::Outcome(ClaimOutcome::AlreadyProcessing { .. })
        ));

        let later = now + chrono::Duration::seconds(31);
        match evaluate_existing(&existing, &request("h"), &policy(), "i2", later) {
            ClaimDecision::Reclaim(rec) => {
                assert_eq!(rec.retry_count, 1);
                assert_eq!(rec.instance_id.as_deref(), Some("i2"));
                assert_eq!(rec.created_at, existing.created_at);
            }
            other => panic!("expected reclaim, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_retries_are_bounded() {
        let now = Utc::now();
        let mut existing = IdempotencyRecord::processing(&request("h"), &policy(), "i1", now)
            .finished(&Finish::Failed("boom".into()), Duration::from_secs(60), now);

        assert!(matches!(
            evaluate_existing(&existing, &request("h"), &policy(), "i1", now),
            ClaimDecision::Reclaim(_)
        ));

        existing.retry_count = 2;
        assert_eq!(
            evaluate_existing(&existing, &request("h"), &policy(), "i1", now),
            ClaimDecision::Outcome(ClaimOutcome::Failed {
                error: Some("boom".to_string()),
                retry_count: 2
            })
        );
    }

    #[test]
    fn test_completed_returns_cached_result() {
        let now = Utc::now();
        let existing = IdempotencyRecord::processing(&request("h"), &policy(), "i1", now).finished(
            &Finish::Completed(Some(serde_json::json!({"tx": "0xabc"}))),
            Duration::from_secs(60),
            now,
        );
        let decision = evaluate_existing(&existing, &request("h"), &policy(), "i2", now);
        assert_eq!(
            decision,
            ClaimDecision::Outcome(ClaimOutcome::Completed {
                result: Some(serde_json::json!({"tx": "0xabc"}))
            })
        );
    }

    #[test]
    fn test_expired_record_is_replaced_even_with_new_hash() {
        let now = Utc::now();
        let existing = IdempotencyRecord::processing(&request("h1"), &policy(), "i1", now);
        let later = now + chrono::Duration::seconds(61);
        match evaluate_existing(&existing, &request("h2"), &policy(), "i2", later) {
            ClaimDecision::Reclaim(rec) => {
                assert_eq!(rec.request_hash, "h2");
                assert_eq!(rec.retry_count, 0);
            }
            other => panic!("expected reclaim, got {:?}", other),
        }
        assert_eq!(
            existing.effective_status(later),
            IdempotencyStatus::Expired
        );
    }
}
