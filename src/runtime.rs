//! Composition root
//!
//! Builds every service from one [`AppConfig`], wires the leader-only jobs to
//! the election and owns their lifecycle.
//!
//! ```text
//! CoordinationStore ──┬── IdempotencyService ──┬── JobIdempotencyService
//!                     │                        └── SagaCoordinator
//!                     ├── LeaderElection ── LeaderJobCoordinator
//!                     └── CleanupService
//! EntityStore ─────────── StateMachineEngine
//! ```

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

use crate::cleanup::{CleanupService, InvalidationRegistry, default_rules};
use crate::config::{AppConfig, CoordinationBackend};
use crate::coordination::{CoordinationStore, MemoryCoordinationStore, PgCoordinationStore};
use crate::election::{ElectionListener, LeaderElection, LeaderJobCoordinator, ScheduledJob};
use crate::error::{CoreError, Result};
use crate::idempotency::{
    CoordinationIdempotencyStore, IdempotencyService, IdempotencyStore, JobHandler,
    JobIdempotencyService, PgIdempotencyStore,
};
use crate::locking::{EntityStore, MemoryEntityStore, PgEntityStore};
use crate::ops::Operations;
use crate::saga::{HandlerRegistry, SagaCoordinator};
use crate::state_machine::StateMachineEngine;

// ============================================================
// LEADER JOBS
// ============================================================

struct CleanupCycleJob(Arc<CleanupService>);

#[async_trait]
impl JobHandler for CleanupCycleJob {
    async fn run(&self, _params: &Value) -> Result<Value> {
        Ok(serde_json::to_value(self.0.run_cycle().await?)?)
    }
}

struct IdempotencyGcJob(Arc<IdempotencyService>);

#[async_trait]
impl JobHandler for IdempotencyGcJob {
    async fn run(&self, _params: &Value) -> Result<Value> {
        Ok(Value::from(self.0.purge_expired().await?))
    }
}

struct SagaRecoveryJob(Arc<SagaCoordinator>);

#[async_trait]
impl JobHandler for SagaRecoveryJob {
    async fn run(&self, _params: &Value) -> Result<Value> {
        Ok(Value::from(self.0.recover_stalled().await?))
    }
}

struct JobTimeoutSweepJob(Arc<JobIdempotencyService>);

#[async_trait]
impl JobHandler for JobTimeoutSweepJob {
    async fn run(&self, _params: &Value) -> Result<Value> {
        Ok(Value::from(self.0.sweep_timeouts().await?))
    }
}

// ============================================================
// SERVICES
// ============================================================

pub struct CoreServices {
    pub config: AppConfig,
    pub instance_id: String,
    pub store: Arc<dyn CoordinationStore>,
    pub engine: Arc<StateMachineEngine>,
    pub idempotency: Arc<IdempotencyService>,
    pub jobs: Arc<JobIdempotencyService>,
    pub sagas: Arc<SagaCoordinator>,
    pub election: Arc<LeaderElection>,
    pub leader_jobs: Arc<LeaderJobCoordinator>,
    pub cleanup: Arc<CleanupService>,
    pub ops: Operations,
    started: AtomicBool,
    listener_wired: AtomicBool,
}

impl CoreServices {
    /// Pick backends from config. Without a pool everything runs in memory.
    pub fn build(config: AppConfig, pool: Option<PgPool>) -> Result<Self> {
        let store: Arc<dyn CoordinationStore> = match (config.coordination.backend, &pool) {
            (CoordinationBackend::Memory, _) => Arc::new(MemoryCoordinationStore::new()),
            (CoordinationBackend::Postgres, Some(pool)) => {
                Arc::new(PgCoordinationStore::new(pool.clone()))
            }
            (CoordinationBackend::Postgres, None) => {
                return Err(CoreError::Config(
                    "postgres coordination backend needs a connection pool".to_string(),
                ));
            }
        };
        let entities: Arc<dyn EntityStore> = match &pool {
            Some(pool) => Arc::new(PgEntityStore::new(
                pool.clone(),
                config.state_machine.tables.clone(),
            )?),
            None => Arc::new(MemoryEntityStore::new()),
        };
        let fallback: Option<Arc<dyn IdempotencyStore>> = match &pool {
            Some(pool) if config.idempotency.fallback_enabled => {
                Some(Arc::new(PgIdempotencyStore::new(pool.clone())))
            }
            _ => None,
        };
        Self::with_stores(config, store, entities, fallback)
    }

    /// Assemble around explicit stores; tests use this with memory backends
    pub fn with_stores(
        config: AppConfig,
        store: Arc<dyn CoordinationStore>,
        entities: Arc<dyn EntityStore>,
        fallback: Option<Arc<dyn IdempotencyStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("txn-{}", ulid::Ulid::new()));

        let engine = Arc::new(StateMachineEngine::new(entities, &config.state_machine)?);
        let idempotency = Arc::new(IdempotencyService::new(
            Arc::new(CoordinationIdempotencyStore::new(Arc::clone(&store))),
            fallback,
            config.idempotency.clone(),
            instance_id.clone(),
        ));
        let jobs = Arc::new(JobIdempotencyService::new(
            Arc::clone(&idempotency),
            Arc::clone(&store),
            config.jobs.clone(),
        ));
        let sagas = Arc::new(SagaCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&idempotency),
            Arc::new(HandlerRegistry::new()),
            config.saga.clone(),
        ));
        let election = Arc::new(LeaderElection::new(
            Arc::clone(&store),
            config.election.clone(),
            instance_id.clone(),
        ));
        let leader_jobs = Arc::new(LeaderJobCoordinator::new(
            election.leadership(),
            Some(Arc::clone(&jobs)),
        ));
        let cleanup = Arc::new(
            CleanupService::new(
                Arc::clone(&store),
                default_rules(&config.cleanup, config.saga.record_ttl_secs)?,
                config.cleanup.clone(),
                Some(election.leadership()),
            )
            .with_invalidation(InvalidationRegistry::with_defaults()?),
        );

        let secs = Duration::from_secs;
        for job in [
            ScheduledJob::new(
                "cleanup_cycle",
                secs(config.cleanup.interval_secs),
                Arc::new(CleanupCycleJob(Arc::clone(&cleanup))),
            ),
            ScheduledJob::new(
                "idempotency_gc",
                secs(config.cleanup.idempotency_gc_interval_secs),
                Arc::new(IdempotencyGcJob(Arc::clone(&idempotency))),
            ),
            ScheduledJob::new(
                "saga_recovery",
                secs(config.cleanup.saga_recovery_interval_secs),
                Arc::new(SagaRecoveryJob(Arc::clone(&sagas))),
            ),
            ScheduledJob::new(
                "job_timeout_sweep",
                secs(config.cleanup.job_timeout_sweep_interval_secs),
                Arc::new(JobTimeoutSweepJob(Arc::clone(&jobs))),
            ),
        ] {
            leader_jobs.register(job);
        }

        let ops = Operations::new(
            Arc::clone(&engine),
            Arc::clone(&idempotency),
            Arc::clone(&jobs),
            Arc::clone(&sagas),
            Arc::clone(&election),
            Arc::clone(&cleanup),
        );

        info!(
            instance_id = %instance_id,
            coordination = store.name(),
            entity_types = ?engine.entity_types(),
            "Core services assembled"
        );

        Ok(Self {
            config,
            instance_id,
            store,
            engine,
            idempotency,
            jobs,
            sagas,
            election,
            leader_jobs,
            cleanup,
            ops,
            started: AtomicBool::new(false),
            listener_wired: AtomicBool::new(false),
        })
    }

    /// Join the election; leader jobs follow leadership from here on
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.store.ping().await {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        if !self.listener_wired.swap(true, Ordering::AcqRel) {
            let listener: Arc<dyn ElectionListener> = self.leader_jobs.clone();
            self.election.add_listener(listener).await;
        }
        self.election.start().await;
        info!(instance_id = %self.instance_id, "Core services started");
        Ok(())
    }

    /// Leave the election and stop local background work
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.election.stop().await;
        self.leader_jobs.stop_all();
        self.sagas.stop();
        info!(instance_id = %self.instance_id, "Core services stopped");
    }
}
