//! State Machine Engine
//!
//! Transition order, all under the row lock:
//!
//! ```text
//! lock -> version check -> terminal check -> table check -> business rules
//!      -> pre_validate -> versioned write -> side effects -> commit
//! ```
//!
//! Any failure before commit rolls back. `post_commit` and observers run after
//! the lock is released and cannot change the result.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::definitions::{EntityDefinition, default_definitions};
use super::types::{TransitionContext, TransitionObserver, TransitionOptions, TransitionResult};
use crate::config::StateMachineConfig;
use crate::error::{CoreError, Result};
use crate::locking::{EntityLock, EntityRecord, EntityStore, LockMetricsSnapshot};

/// Writes one line per attempt to the `audit` target
pub struct AuditLogObserver;

#[async_trait::async_trait]
impl TransitionObserver for AuditLogObserver {
    async fn on_transition(&self, r: &TransitionResult) -> Result<()> {
        if r.success {
            tracing::info!(
                target: "audit",
                entity_type = %r.entity_type,
                entity_id = %r.entity_id,
                transition = %r.transition_name,
                from = r.previous_state.as_deref().unwrap_or(""),
                to = r.new_state.as_deref().unwrap_or(""),
                version_before = r.version_before.unwrap_or_default(),
                version_after = r.version_after.unwrap_or_default(),
                initiated_by = r.initiated_by.as_deref().unwrap_or("system"),
                duration_us = r.duration.as_micros() as u64,
                "transition committed"
            );
        } else {
            tracing::info!(
                target: "audit",
                entity_type = %r.entity_type,
                entity_id = %r.entity_id,
                transition = %r.transition_name,
                from = r.previous_state.as_deref().unwrap_or(""),
                to = %r.target_state,
                error_code = r.error_code().unwrap_or(""),
                initiated_by = r.initiated_by.as_deref().unwrap_or("system"),
                "transition rejected"
            );
        }
        Ok(())
    }
}

/// What happened under the lock before commit
struct Applied {
    ctx: TransitionContext,
    side_effects: Vec<String>,
}

pub struct StateMachineEngine {
    store: Arc<dyn EntityStore>,
    definitions: HashMap<String, Arc<dyn EntityDefinition>>,
    observers: Vec<Arc<dyn TransitionObserver>>,
    lock_timeout: Duration,
}

impl StateMachineEngine {
    /// Engine with the built-in definitions and the audit observer
    pub fn new(store: Arc<dyn EntityStore>, config: &StateMachineConfig) -> Result<Self> {
        let mut engine = Self::empty(store, config.lock_timeout());
        for def in default_definitions()? {
            engine.register(def);
        }
        engine.add_observer(Arc::new(AuditLogObserver));
        Ok(engine)
    }

    pub fn empty(store: Arc<dyn EntityStore>, lock_timeout: Duration) -> Self {
        Self {
            store,
            definitions: HashMap::new(),
            observers: Vec::new(),
            lock_timeout,
        }
    }

    pub fn register(&mut self, definition: Arc<dyn EntityDefinition>) {
        self.definitions
            .insert(definition.entity_type().to_string(), definition);
    }

    pub fn add_observer(&mut self, observer: Arc<dyn TransitionObserver>) {
        self.observers.push(observer);
    }

    fn definition(&self, entity_type: &str) -> Result<&Arc<dyn EntityDefinition>> {
        self.definitions
            .get(entity_type)
            .ok_or_else(|| CoreError::UnknownEntityType(entity_type.to_string()))
    }

    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.keys().cloned().collect();
        types.sort();
        types
    }

    /// Targets reachable from `state` without an admin override
    pub fn allowed_transitions(&self, entity_type: &str, state: &str) -> Result<Vec<String>> {
        Ok(self.definition(entity_type)?.table().allowed_from(state))
    }

    pub async fn get_entity(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>> {
        self.definition(entity_type)?;
        self.store.load(entity_type, id).await
    }

    pub fn lock_metrics(&self) -> LockMetricsSnapshot {
        self.store.metrics()
    }

    /// Insert a new entity in one of its initial states
    pub async fn create_entity(
        &self,
        entity_type: &str,
        id: &str,
        initial_state: &str,
        attributes: Value,
    ) -> Result<EntityRecord> {
        let table = self.definition(entity_type)?.table();
        if !table.is_initial(initial_state) {
            return Err(CoreError::InvalidTransition {
                entity_type: entity_type.to_string(),
                entity_id: id.to_string(),
                from: "null".to_string(),
                to: initial_state.to_string(),
            });
        }
        let record = EntityRecord::new(entity_type, id, initial_state, attributes);
        self.store.insert(&record).await?;
        tracing::info!(
            entity_type = %entity_type,
            entity_id = %id,
            state = %initial_state,
            "Entity created"
        );
        Ok(record)
    }

    /// Move one entity to `target_state`.
    ///
    /// Never panics or returns early: every outcome, including lock timeouts
    /// and unknown entity types, is reported through the result.
    pub async fn transition(
        &self,
        entity_type: &str,
        entity_id: &str,
        target_state: &str,
        transition_name: &str,
        opts: TransitionOptions,
    ) -> TransitionResult {
        let started = Instant::now();
        let mut result = TransitionResult {
            success: false,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            transition_name: transition_name.to_string(),
            target_state: target_state.to_string(),
            previous_state: None,
            new_state: None,
            version_before: None,
            version_after: None,
            side_effects: Vec::new(),
            initiated_by: opts.initiated_by.clone(),
            error: None,
            duration: Duration::ZERO,
        };

        let committed = self
            .run_transition(
                entity_type,
                entity_id,
                target_state,
                transition_name,
                &opts,
                &mut result,
            )
            .await;

        match committed {
            Ok((entity, applied)) => {
                result.success = true;
                result.new_state = Some(entity.state.clone());
                result.version_after = Some(entity.version);
                result.side_effects = applied.side_effects;
                result.duration = started.elapsed();

                if let Ok(def) = self.definition(entity_type)
                    && let Err(e) = def.post_commit(&entity, &applied.ctx).await
                {
                    tracing::warn!(
                        entity_type = %entity_type,
                        entity_id = %entity_id,
                        transition = %transition_name,
                        error = %e,
                        "post_commit hook failed"
                    );
                }
            }
            Err(e) => {
                tracing::debug!(
                    entity_type = %entity_type,
                    entity_id = %entity_id,
                    target = %target_state,
                    code = e.code(),
                    error = %e,
                    "Transition rejected"
                );
                result.error = Some(e);
                result.duration = started.elapsed();
            }
        }

        for observer in &self.observers {
            if let Err(e) = observer.on_transition(&result).await {
                tracing::warn!(error = %e, "Transition observer failed");
            }
        }
        result
    }

    async fn run_transition(
        &self,
        entity_type: &str,
        entity_id: &str,
        target_state: &str,
        transition_name: &str,
        opts: &TransitionOptions,
        result: &mut TransitionResult,
    ) -> Result<(EntityRecord, Applied)> {
        let def = self.definition(entity_type)?;
        let timeout = opts.lock_timeout.unwrap_or(self.lock_timeout);
        let mut lock = self.store.lock(entity_type, entity_id, timeout).await?;

        let entity = lock.record().clone();
        let waited = lock.waited();
        result.previous_state = Some(entity.state.clone());
        result.version_before = Some(entity.version);

        let applied = Self::apply_locked(
            def.as_ref(),
            &mut lock,
            &entity,
            target_state,
            transition_name,
            opts,
        )
        .await;

        match applied {
            Ok(applied) => {
                let committed = lock.commit().await?;
                tracing::debug!(
                    entity_type = %entity_type,
                    entity_id = %entity_id,
                    from = %entity.state,
                    to = %committed.state,
                    version = committed.version,
                    lock_wait_us = waited.as_micros() as u64,
                    "Transition committed"
                );
                Ok((committed, applied))
            }
            Err(e) => {
                if let Err(rb) = lock.rollback().await {
                    tracing::warn!(
                        entity_type = %entity_type,
                        entity_id = %entity_id,
                        error = %rb,
                        "Rollback after rejected transition failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn apply_locked(
        def: &dyn EntityDefinition,
        lock: &mut Box<dyn EntityLock>,
        entity: &EntityRecord,
        target_state: &str,
        transition_name: &str,
        opts: &TransitionOptions,
    ) -> Result<Applied> {
        let table = def.table();

        if let Some(expected) = opts.expected_version {
            lock.check_version(expected)?;
        }

        if table.is_terminal(&entity.state) && !opts.admin_override {
            return Err(CoreError::TerminalStateViolation {
                entity_id: entity.id.clone(),
                state: entity.state.clone(),
            });
        }

        let allowed = table.can_transition(&entity.state, target_state)
            || (opts.admin_override && table.admin_can_transition(&entity.state, target_state));
        if !allowed {
            return Err(CoreError::InvalidTransition {
                entity_type: entity.entity_type.clone(),
                entity_id: entity.id.clone(),
                from: entity.state.clone(),
                to: target_state.to_string(),
            });
        }

        let financial = opts
            .financial
            .unwrap_or_else(|| table.is_financial(target_state));
        let ctx = TransitionContext::new(entity, target_state, transition_name, financial, opts);

        def.validate_business_rules(entity, &ctx)?;
        def.pre_validate(entity, &ctx)?;

        let written = lock.write_state(target_state, entity.version).await?;

        let mut side_effects = Vec::with_capacity(opts.side_effects.len());
        for effect in &opts.side_effects {
            effect
                .apply(&ctx, &written)
                .await
                .map_err(|e| CoreError::SideEffectFailed {
                    name: effect.name().to_string(),
                    reason: e.to_string(),
                })?;
            side_effects.push(effect.name().to_string());
        }

        Ok(Applied { ctx, side_effects })
    }
}
