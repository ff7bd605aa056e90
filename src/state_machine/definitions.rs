//! Entity definitions
//!
//! One definition per coordinated entity type: its transition table plus the
//! hooks the engine calls around the state write.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

use super::table::TransitionTable;
use super::types::TransitionContext;
use crate::error::{CoreError, Result};
use crate::locking::EntityRecord;

#[async_trait]
pub trait EntityDefinition: Send + Sync {
    fn table(&self) -> &TransitionTable;

    fn entity_type(&self) -> &str {
        self.table().entity_type()
    }

    /// Domain rules beyond the table (who may move where)
    fn validate_business_rules(&self, _entity: &EntityRecord, _ctx: &TransitionContext) -> Result<()> {
        Ok(())
    }

    /// Field checks on the locked row before the write
    fn pre_validate(&self, _entity: &EntityRecord, ctx: &TransitionContext) -> Result<()> {
        require_financial_fields(ctx)
    }

    /// Runs after commit, outside the lock
    async fn post_commit(&self, _entity: &EntityRecord, _ctx: &TransitionContext) -> Result<()> {
        Ok(())
    }
}

/// Financial transitions need a positive amount and a currency
pub fn require_financial_fields(ctx: &TransitionContext) -> Result<()> {
    if !ctx.financial {
        return Ok(());
    }
    let mut missing = Vec::new();
    if ctx.amount.is_none_or(|a| a <= Decimal::ZERO) {
        missing.push("amount");
    }
    if ctx.currency.as_deref().is_none_or(str::is_empty) {
        missing.push("currency");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(CoreError::MissingFinancialFields(format!(
            "{} {} -> {} requires {}",
            ctx.entity_type,
            ctx.entity_id,
            ctx.target_state,
            missing.join(", ")
        )))
    }
}

fn require_attribute(entity: &EntityRecord, ctx: &TransitionContext, name: &str) -> Result<()> {
    if entity.has_attribute(name) {
        Ok(())
    } else {
        Err(CoreError::BusinessRuleViolation(format!(
            "{} {} -> {} requires {}",
            ctx.entity_type, ctx.entity_id, ctx.target_state, name
        )))
    }
}

fn admin_only(ctx: &TransitionContext) -> Result<()> {
    if ctx.admin_override {
        Ok(())
    } else {
        Err(CoreError::BusinessRuleViolation(format!(
            "{} {} -> {} is restricted to administrators",
            ctx.entity_type, ctx.current_state, ctx.target_state
        )))
    }
}

// ============================================================================
// Escrow
// ============================================================================

pub struct EscrowDefinition {
    table: TransitionTable,
}

impl EscrowDefinition {
    pub fn new() -> Result<Self> {
        let table = TransitionTable::builder("escrow")
            .states(&[
                "CREATED",
                "PAYMENT_PENDING",
                "PARTIAL_PAYMENT",
                "PAYMENT_CONFIRMED",
                "ACTIVE",
                "DISPUTED",
                "COMPLETED",
                "REFUNDED",
                "CANCELLED",
                "EXPIRED",
            ])
            .initial(&["CREATED"])
            .allow("CREATED", &["PAYMENT_PENDING", "CANCELLED", "EXPIRED"])
            .allow(
                "PAYMENT_PENDING",
                &["PARTIAL_PAYMENT", "PAYMENT_CONFIRMED", "CANCELLED", "EXPIRED"],
            )
            .allow(
                "PARTIAL_PAYMENT",
                &["PARTIAL_PAYMENT", "PAYMENT_CONFIRMED", "REFUNDED", "EXPIRED"],
            )
            .allow("PAYMENT_CONFIRMED", &["ACTIVE", "REFUNDED"])
            .allow("ACTIVE", &["COMPLETED", "DISPUTED", "CANCELLED"])
            .allow("DISPUTED", &["COMPLETED", "REFUNDED"])
            .terminal(&["COMPLETED", "REFUNDED", "CANCELLED", "EXPIRED"])
            // Late payments on dead escrows are refunded by support
            .admin_allow("CANCELLED", &["REFUNDED"])
            .admin_allow("EXPIRED", &["REFUNDED"])
            .financial(&[
                "PARTIAL_PAYMENT",
                "PAYMENT_CONFIRMED",
                "COMPLETED",
                "REFUNDED",
            ])
            .build()?;
        Ok(Self { table })
    }
}

#[async_trait]
impl EntityDefinition for EscrowDefinition {
    fn table(&self) -> &TransitionTable {
        &self.table
    }

    fn validate_business_rules(&self, _entity: &EntityRecord, ctx: &TransitionContext) -> Result<()> {
        match (ctx.current_state.as_str(), ctx.target_state.as_str()) {
            // Funds are locked; only support may cancel
            ("ACTIVE", "CANCELLED") => admin_only(ctx),
            // Dispute resolution
            ("DISPUTED", _) => admin_only(ctx),
            _ => Ok(()),
        }
    }

    fn pre_validate(&self, entity: &EntityRecord, ctx: &TransitionContext) -> Result<()> {
        require_financial_fields(ctx)?;
        if ctx.target_state == "COMPLETED" {
            require_attribute(entity, ctx, "seller_id")?;
        }
        Ok(())
    }
}

// ============================================================================
// Cashout
// ============================================================================

pub struct CashoutDefinition {
    table: TransitionTable,
}

impl CashoutDefinition {
    pub fn new() -> Result<Self> {
        let table = TransitionTable::builder("cashout")
            .states(&[
                "PENDING",
                "APPROVED",
                "PROCESSING",
                "COMPLETED",
                "FAILED",
                "CANCELLED",
                "REFUNDED",
            ])
            .initial(&["PENDING"])
            .allow("PENDING", &["APPROVED", "CANCELLED", "FAILED"])
            .allow("APPROVED", &["PROCESSING", "CANCELLED"])
            .allow("PROCESSING", &["COMPLETED", "FAILED"])
            .terminal(&["COMPLETED", "FAILED", "CANCELLED", "REFUNDED"])
            .admin_allow("FAILED", &["REFUNDED"])
            .financial(&["PROCESSING", "COMPLETED", "REFUNDED"])
            .build()?;
        Ok(Self { table })
    }
}

#[async_trait]
impl EntityDefinition for CashoutDefinition {
    fn table(&self) -> &TransitionTable {
        &self.table
    }

    fn validate_business_rules(&self, _entity: &EntityRecord, ctx: &TransitionContext) -> Result<()> {
        match (ctx.current_state.as_str(), ctx.target_state.as_str()) {
            ("APPROVED", "CANCELLED") => admin_only(ctx),
            _ => Ok(()),
        }
    }

    fn pre_validate(&self, entity: &EntityRecord, ctx: &TransitionContext) -> Result<()> {
        require_financial_fields(ctx)?;
        if ctx.target_state == "PROCESSING" {
            require_attribute(entity, ctx, "destination")?;
        }
        Ok(())
    }
}

// ============================================================================
// Unified transaction (currency exchange)
// ============================================================================

pub struct UnifiedTransactionDefinition {
    table: TransitionTable,
}

impl UnifiedTransactionDefinition {
    pub fn new() -> Result<Self> {
        let table = TransitionTable::builder("unified_transaction")
            .states(&[
                "PENDING",
                "AWAITING_PAYMENT",
                "PAYMENT_RECEIVED",
                "PROCESSING",
                "COMPLETED",
                "FAILED",
                "CANCELLED",
                "EXPIRED",
                "REFUNDED",
            ])
            .initial(&["PENDING"])
            .allow("PENDING", &["AWAITING_PAYMENT", "CANCELLED"])
            .allow("AWAITING_PAYMENT", &["PAYMENT_RECEIVED", "EXPIRED", "CANCELLED"])
            .allow("PAYMENT_RECEIVED", &["PROCESSING", "REFUNDED"])
            .allow("PROCESSING", &["COMPLETED", "FAILED"])
            .terminal(&["COMPLETED", "FAILED", "CANCELLED", "EXPIRED", "REFUNDED"])
            .admin_allow("FAILED", &["REFUNDED"])
            .admin_allow("EXPIRED", &["REFUNDED"])
            .financial(&["PAYMENT_RECEIVED", "COMPLETED", "REFUNDED"])
            .build()?;
        Ok(Self { table })
    }
}

#[async_trait]
impl EntityDefinition for UnifiedTransactionDefinition {
    fn table(&self) -> &TransitionTable {
        &self.table
    }

    fn pre_validate(&self, entity: &EntityRecord, ctx: &TransitionContext) -> Result<()> {
        require_financial_fields(ctx)?;
        if ctx.target_state == "PROCESSING" {
            require_attribute(entity, ctx, "exchange_rate")?;
        }
        Ok(())
    }
}

/// The built-in definitions
pub fn default_definitions() -> Result<Vec<Arc<dyn EntityDefinition>>> {
    Ok(vec![
        Arc::new(EscrowDefinition::new()?),
        Arc::new(CashoutDefinition::new()?),
        Arc::new(UnifiedTransactionDefinition::new()?),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::TransitionOptions;
    use serde_json::json;

    fn active_escrow() -> EntityRecord {
        EntityRecord::new(
            "escrow",
            "e1",
            "ACTIVE",
            json!({"amount": "10", "currency": "USDT", "seller_id": "s1"}),
        )
    }

    fn ctx(entity: &EntityRecord, table: &TransitionTable, target: &str, opts: &TransitionOptions) -> TransitionContext {
        TransitionContext::new(entity, target, "test", table.is_financial(target), opts)
    }

    #[test]
    fn test_default_definitions_build() {
        let defs = default_definitions().unwrap();
        let types: Vec<&str> = defs.iter().map(|d| d.entity_type()).collect();
        assert_eq!(types, vec!["escrow", "cashout", "unified_transaction"]);
    }

    #[test]
    fn test_escrow_table_shape() {
        let def = EscrowDefinition::new().unwrap();
        let t = def.table();
        assert!(t.can_transition("CREATED", "PAYMENT_PENDING"));
        assert!(!t.can_transition("CREATED", "COMPLETED"));
        assert!(t.can_transition("PARTIAL_PAYMENT", "PARTIAL_PAYMENT"));
        assert!(!t.can_transition("ACTIVE", "ACTIVE"));
        assert!(t.is_terminal("COMPLETED"));
        assert!(t.is_financial("PAYMENT_CONFIRMED"));
        assert!(t.admin_can_transition("EXPIRED", "REFUNDED"));
    }

    #[test]
    fn test_escrow_cancel_while_active_is_admin_only() {
        let def = EscrowDefinition::new().unwrap();
        let entity = active_escrow();
        let user = ctx(&entity, def.table(), "CANCELLED", &TransitionOptions::by("buyer"));
        let err = def.validate_business_rules(&entity, &user).unwrap_err();
        assert_eq!(err.code(), "BUSINESS_RULE_VIOLATION");

        let admin = ctx(
            &entity,
            def.table(),
            "CANCELLED",
            &TransitionOptions::by("support").admin(),
        );
        assert!(def.validate_business_rules(&entity, &admin).is_ok());
    }

    #[test]
    fn test_escrow_completion_needs_counterparty_and_amount() {
        let def = EscrowDefinition::new().unwrap();
        let no_seller = EntityRecord::new(
            "escrow",
            "e1",
            "ACTIVE",
            json!({"amount": "10", "currency": "USDT"}),
        );
        let c = ctx(&no_seller, def.table(), "COMPLETED", &TransitionOptions::default());
        assert_eq!(
            def.pre_validate(&no_seller, &c).unwrap_err().code(),
            "BUSINESS_RULE_VIOLATION"
        );

        let blank_seller = EntityRecord::new(
            "escrow",
            "e1",
            "ACTIVE",
            json!({"seller_id": "", "amount": "10", "currency": "USDT"}),
        );
        let c = ctx(&blank_seller, def.table(), "COMPLETED", &TransitionOptions::default());
        assert_eq!(
            def.pre_validate(&blank_seller, &c).unwrap_err().code(),
            "BUSINESS_RULE_VIOLATION"
        );

        let no_amount = EntityRecord::new("escrow", "e1", "ACTIVE", json!({"seller_id": "s"}));
        let c = ctx(&no_amount, def.table(), "COMPLETED", &TransitionOptions::default());
        let err = def.pre_validate(&no_amount, &c).unwrap_err();
        assert_eq!(err.code(), "MISSING_FINANCIAL_FIELDS");
        assert!(err.to_string().contains("amount, currency"));

        let ok = active_escrow();
        let c = ctx(&ok, def.table(), "COMPLETED", &TransitionOptions::default());
        assert!(def.pre_validate(&ok, &c).is_ok());
    }

    #[test]
    fn test_zero_amount_is_missing() {
        let entity = EntityRecord::new("cashout", "c1", "APPROVED", json!({"destination": "x"}));
        let def = CashoutDefinition::new().unwrap();
        let opts = TransitionOptions::default().with_amount(Decimal::ZERO, "NGN");
        let c = ctx(&entity, def.table(), "PROCESSING", &opts);
        assert_eq!(
            def.pre_validate(&entity, &c).unwrap_err().code(),
            "MISSING_FINANCIAL_FIELDS"
        );
    }
}
