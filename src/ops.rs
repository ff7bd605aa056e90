//! Operational surface
//!
//! Reads for support tooling plus one remediation command (`force_cleanup`).

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cleanup::{CleanupService, CleanupStats};
use crate::election::{LeaderElection, LeaderInfo};
use crate::error::Result;
use crate::idempotency::{IdempotencyService, JobIdempotencyService, JobResult};
use crate::locking::LockMetricsSnapshot;
use crate::saga::{SagaCoordinator, SagaTransaction};
use crate::state_machine::StateMachineEngine;

/// Point-in-time view of one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub instance_id: String,
    pub is_leader: bool,
    pub coordination_safe: bool,
    pub active_sagas: usize,
    pub lock_metrics: LockMetricsSnapshot,
}

#[derive(Clone)]
pub struct Operations {
    engine: Arc<StateMachineEngine>,
    idempotency: Arc<IdempotencyService>,
    jobs: Arc<JobIdempotencyService>,
    sagas: Arc<SagaCoordinator>,
    election: Arc<LeaderElection>,
    cleanup: Arc<CleanupService>,
}

impl Operations {
    pub fn new(
        engine: Arc<StateMachineEngine>,
        idempotency: Arc<IdempotencyService>,
        jobs: Arc<JobIdempotencyService>,
        sagas: Arc<SagaCoordinator>,
        election: Arc<LeaderElection>,
        cleanup: Arc<CleanupService>,
    ) -> Self {
        Self {
            engine,
            idempotency,
            jobs,
            sagas,
            election,
            cleanup,
        }
    }

    /// Remediation: sweep now, optionally restricted to one key pattern
    pub async fn force_cleanup(&self, pattern: Option<&str>) -> Result<CleanupStats> {
        tracing::warn!(pattern = pattern.unwrap_or("*"), "Operator forced cleanup");
        self.cleanup.force_cleanup(pattern).await
    }

    pub fn lock_metrics(&self) -> LockMetricsSnapshot {
        self.engine.lock_metrics()
    }

    pub async fn leader_info(&self) -> Result<Option<LeaderInfo>> {
        self.election.get_leader_info().await
    }

    pub async fn saga_status(&self, saga_id: &str) -> Result<SagaTransaction> {
        self.sagas.get_saga_status(saga_id).await
    }

    /// `id` is an execution id or a job fingerprint
    pub async fn job_result(&self, id: &str) -> Result<Option<JobResult>> {
        self.jobs.get_job_result(id).await
    }

    pub async fn health(&self) -> InstanceHealth {
        InstanceHealth {
            instance_id: self.idempotency.instance_id().to_string(),
            is_leader: self.election.is_leader(),
            coordination_safe: self.idempotency.coordination_is_safe().await,
            active_sagas: self.sagas.active_count(),
            lock_metrics: self.engine.lock_metrics(),
        }
    }
}
