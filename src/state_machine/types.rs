//! Transition request, context and result types

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::locking::EntityRecord;

/// Work executed while the row lock is held, before commit.
///
/// An error aborts the transition and rolls back the state write.
#[async_trait]
pub trait TransitionSideEffect: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, ctx: &TransitionContext, entity: &EntityRecord) -> Result<()>;
}

/// Notified after every transition attempt, outside the lock.
///
/// Errors are logged and never change the transition result.
#[async_trait]
pub trait TransitionObserver: Send + Sync {
    async fn on_transition(&self, result: &TransitionResult) -> Result<()>;
}

/// Caller-supplied transition options
#[derive(Clone, Default)]
pub struct TransitionOptions {
    pub initiated_by: Option<String>,
    pub admin_override: bool,
    /// Defaults to whether the target is a financial state
    pub financial: Option<bool>,
    /// Defaults to the entity's `amount` attribute
    pub amount: Option<Decimal>,
    /// Defaults to the entity's `currency` attribute
    pub currency: Option<String>,
    pub metadata: Map<String, Value>,
    /// Fail with `VersionConflict` unless the locked row has this version
    pub expected_version: Option<i64>,
    pub lock_timeout: Option<Duration>,
    pub side_effects: Vec<Arc<dyn TransitionSideEffect>>,
}

impl fmt::Debug for TransitionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionOptions")
            .field("initiated_by", &self.initiated_by)
            .field("admin_override", &self.admin_override)
            .field("financial", &self.financial)
            .field("amount", &self.amount)
            .field("currency", &self.currency)
            .field("expected_version", &self.expected_version)
            .field("side_effects", &self.side_effects.len())
            .finish()
    }
}

impl TransitionOptions {
    pub fn by(user: impl Into<String>) -> Self {
        Self {
            initiated_by: Some(user.into()),
            ..Self::default()
        }
    }

    pub fn admin(mut self) -> Self {
        self.admin_override = true;
        self
    }

    pub fn with_amount(mut self, amount: Decimal, currency: impl Into<String>) -> Self {
        self.amount = Some(amount);
        self.currency = Some(currency.into());
        self
    }

    pub fn financial(mut self, financial: bool) -> Self {
        self.financial = Some(financial);
        self
    }

    pub fn expect_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_side_effect(mut self, effect: Arc<dyn TransitionSideEffect>) -> Self {
        self.side_effects.push(effect);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }
}

/// Everything the hooks see about one transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionContext {
    pub entity_type: String,
    pub entity_id: String,
    pub current_state: String,
    pub target_state: String,
    pub transition_name: String,
    pub initiated_by: Option<String>,
    pub financial: bool,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub metadata: Map<String, Value>,
    pub admin_override: bool,
    /// Version observed under the lock
    pub version: i64,
}

impl TransitionContext {
    pub(crate) fn new(
        entity: &EntityRecord,
        target_state: &str,
        transition_name: &str,
        financial: bool,
        opts: &TransitionOptions,
    ) -> Self {
        Self {
            entity_type: entity.entity_type.clone(),
            entity_id: entity.id.clone(),
            current_state: entity.state.clone(),
            target_state: target_state.to_string(),
            transition_name: transition_name.to_string(),
            initiated_by: opts.initiated_by.clone(),
            financial,
            amount: opts.amount.or_else(|| attribute_decimal(entity, "amount")),
            currency: opts
                .currency
                .clone()
                .or_else(|| entity.attribute_str("currency").map(str::to_string)),
            metadata: opts.metadata.clone(),
            admin_override: opts.admin_override,
            version: entity.version,
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.current_state == self.target_state
    }
}

/// Decimal attribute stored as a JSON string or number
pub fn attribute_decimal(entity: &EntityRecord, name: &str) -> Option<Decimal> {
    match entity.attributes.get(name)? {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

/// Outcome of one transition attempt
#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub success: bool,
    pub entity_type: String,
    pub entity_id: String,
    pub transition_name: String,
    pub target_state: String,
    pub previous_state: Option<String>,
    /// None on failure
    pub new_state: Option<String>,
    pub version_before: Option<i64>,
    pub version_after: Option<i64>,
    /// Names of the side effects that ran
    pub side_effects: Vec<String>,
    pub initiated_by: Option<String>,
    pub error: Option<CoreError>,
    pub duration: Duration,
}

impl TransitionResult {
    pub fn error_code(&self) -> Option<&'static str> {
        self.error.as_ref().map(CoreError::code)
    }

    /// Committed entity version, or the typed failure
    pub fn into_result(self) -> Result<i64> {
        match (self.error, self.version_after) {
            (Some(e), _) => Err(e),
            (None, Some(v)) => Ok(v),
            (None, None) => Err(CoreError::Database(format!(
                "transition of {} {} reported no version",
                self.entity_type, self.entity_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_falls_back_to_entity_amount() {
        let entity = EntityRecord::new(
            "escrow",
            "e1",
            "PAYMENT_PENDING",
            json!({"amount": "125.50", "currency": "USDT"}),
        );
        let ctx = TransitionContext::new(
            &entity,
            "PAYMENT_CONFIRMED",
            "confirm_payment",
            true,
            &TransitionOptions::by("u1"),
        );
        assert_eq!(ctx.amount, Some(Decimal::from_str("125.50").unwrap()));
        assert_eq!(ctx.currency.as_deref(), Some("USDT"));
        assert!(!ctx.is_self_loop());

        let explicit = TransitionOptions::by("u1").with_amount(Decimal::from(7), "NGN");
        let ctx = TransitionContext::new(&entity, "PAYMENT_CONFIRMED", "x", true, &explicit);
        assert_eq!(ctx.amount, Some(Decimal::from(7)));
        assert_eq!(ctx.currency.as_deref(), Some("NGN"));
    }

    #[test]
    fn test_numeric_amount_attribute() {
        let entity = EntityRecord::new("cashout", "c1", "PENDING", json!({"amount": 12.5}));
        assert_eq!(
            attribute_decimal(&entity, "amount"),
            Some(Decimal::from_str("12.5").unwrap())
        );
        assert_eq!(attribute_decimal(&entity, "fee"), None);
    }
}
