//! Step handlers and their registry

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

use super::types::SagaContext;
use crate::error::{CoreError, Result};

/// One unit of saga work.
///
/// Both methods may be invoked again after a crash, so they must be safe to
/// repeat.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, params: &Value, context: &SagaContext) -> Result<Value>;

    /// Undo a completed `execute`. `original` is the value it returned.
    async fn compensate(
        &self,
        _params: &Value,
        _context: &SagaContext,
        _original: Option<&Value>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Handlers by name
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!(handler = %name, "Step handler replaced");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StepHandler>> {
        self.handlers
            .get(name)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| CoreError::UnknownHandler(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
