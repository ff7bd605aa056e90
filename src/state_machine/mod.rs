//! Entity State Machine
//!
//! Legal lifecycle transitions for money-bearing entities. Each entity type
//! registers an [`EntityDefinition`] (transition table plus hooks); the
//! [`StateMachineEngine`] applies transitions atomically through the locking
//! substrate.
//!
//! # Safety Invariants
//!
//! 1. **Declared moves only**: a transition must be an edge of the table
//! 2. **Terminal is final**: leaving a terminal state needs an admin override and an admin edge
//! 3. **Versioned**: each committed transition bumps the version by exactly one
//! 4. **All or nothing**: a failed transition leaves state and version untouched

pub mod definitions;
pub mod engine;
pub mod table;
pub mod types;

pub use definitions::{
    CashoutDefinition, EntityDefinition, EscrowDefinition, UnifiedTransactionDefinition,
    default_definitions, require_financial_fields,
};
pub use engine::{AuditLogObserver, StateMachineEngine};
pub use table::{TransitionTable, TransitionTableBuilder};
pub use types::{
    TransitionContext, TransitionObserver, TransitionOptions, TransitionResult,
    TransitionSideEffect,
};
