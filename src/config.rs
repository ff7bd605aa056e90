use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::error::{CoreError, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    /// PostgreSQL connection URL for entity rows and the idempotency fallback
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// Stable instance identity; a random one is generated when absent
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub state_machine: StateMachineConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub jobs: JobConfig,
    #[serde(default)]
    pub saga: SagaConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "txn_core.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            enable_tracing: true,
            postgres_url: None,
            instance_id: None,
            coordination: CoordinationConfig::default(),
            state_machine: StateMachineConfig::default(),
            idempotency: IdempotencyConfig::default(),
            jobs: JobConfig::default(),
            saga: SagaConfig::default(),
            election: ElectionConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

/// Which backend serves the coordination key space
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CoordinationConfig {
    pub backend: CoordinationBackend,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: CoordinationBackend::Memory,
        }
    }
}

/// Table mapping for one coordinated entity type
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EntityTableConfig {
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_state_column")]
    pub state_column: String,
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_state_column() -> String {
    "state".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StateMachineConfig {
    pub lock_timeout_secs: u64,
    /// entity_type -> table mapping
    pub tables: HashMap<String, EntityTableConfig>,
}

impl StateMachineConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        let mut tables = HashMap::new();
        for (entity_type, table) in [
            ("escrow", "escrows"),
            ("cashout", "cashouts"),
            ("unified_transaction", "unified_transactions"),
        ] {
            tables.insert(
                entity_type.to_string(),
                EntityTableConfig {
                    table: table.to_string(),
                    id_column: default_id_column(),
                    state_column: default_state_column(),
                },
            );
        }
        Self {
            lock_timeout_secs: 30,
            tables,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IdempotencyConfig {
    /// TTL of a processing/failed record
    pub default_ttl_secs: u64,
    /// TTL of a completed record (cached result)
    pub result_ttl_secs: u64,
    /// A processing record older than this may be reclaimed
    pub processing_timeout_secs: u64,
    pub max_retries: u32,
    /// Allow the PostgreSQL fallback when the coordination store is down
    pub fallback_enabled: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            result_ttl_secs: 86_400,
            processing_timeout_secs: 300,
            max_retries: 3,
            fallback_enabled: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobConfig {
    pub execution_ttl_secs: u64,
    pub result_ttl_secs: u64,
    pub default_timeout_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            execution_ttl_secs: 86_400,
            result_ttl_secs: 7 * 86_400,
            default_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SagaConfig {
    pub default_timeout_secs: u64,
    pub step_timeout_secs: u64,
    pub default_max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub record_ttl_secs: u64,
    pub result_ttl_secs: u64,
    /// Running sagas untouched for this long are resumed by the leader
    pub stale_threshold_secs: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            step_timeout_secs: 30,
            default_max_retries: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            record_ttl_secs: 7 * 86_400,
            result_ttl_secs: 30 * 86_400,
            stale_threshold_secs: 120,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElectionConfig {
    pub service_name: String,
    pub heartbeat_interval_ms: u64,
    /// Must exceed the heartbeat interval
    pub leader_ttl_ms: u64,
    pub election_timeout_ms: u64,
    pub election_window_ms: u64,
    pub check_interval_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            service_name: "txn-coordinator".to_string(),
            heartbeat_interval_ms: 5_000,
            leader_ttl_ms: 15_000,
            election_timeout_ms: 15_000,
            election_window_ms: 1_000,
            check_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    pub idempotency_gc_interval_secs: u64,
    pub saga_recovery_interval_secs: u64,
    pub job_timeout_sweep_interval_secs: u64,
    /// Maximum batch chunks per rule per cycle
    pub max_batches_per_cycle: usize,
    /// rule name -> TTL override in seconds
    #[serde(default)]
    pub ttl_overrides: HashMap<String, u64>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            idempotency_gc_interval_secs: 900,
            saga_recovery_interval_secs: 60,
            job_timeout_sweep_interval_secs: 60,
            max_batches_per_cycle: 10,
            ttl_overrides: HashMap::new(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|e| {
            CoreError::Config(format!("Failed to read config file {}: {}", config_path, e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)
            .map_err(|e| CoreError::Config(format!("Failed to parse config yaml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break coordination invariants
    pub fn validate(&self) -> Result<()> {
        if self.election.leader_ttl_ms <= self.election.heartbeat_interval_ms {
            return Err(CoreError::Config(format!(
                "election.leader_ttl_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.election.leader_ttl_ms, self.election.heartbeat_interval_ms
            )));
        }
        if self.idempotency.fallback_enabled && self.postgres_url.is_none() {
            return Err(CoreError::Config(
                "idempotency.fallback_enabled requires postgres_url".to_string(),
            ));
        }
        if self.coordination.backend == CoordinationBackend::Postgres
            && self.postgres_url.is_none()
        {
            return Err(CoreError::Config(
                "coordination.backend = postgres requires postgres_url".to_string(),
            ));
        }
        Ok(())
    }
}
