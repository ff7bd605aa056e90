//! TTL Cleanup & Cache Invalidation
//!
//! Reclaims the ephemeral coordination state the other subsystems leave
//! behind. Scheduled cycles run on the leader only; `force_cleanup` is safe
//! anywhere.

pub mod invalidation;
pub mod rules;
pub mod service;

pub use invalidation::InvalidationRegistry;
pub use rules::{CleanupRule, CleanupStrategy, default_rules};
pub use service::{CleanupService, CleanupStats};
