//! Declarative TTL policies per key namespace

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::CleanupConfig;
use crate::coordination::KeyPattern;
use crate::error::Result;

const HOUR: u64 = 3_600;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupStrategy {
    /// Delete as soon as a sweep finds the key expired
    Immediate,
    /// Delete in bounded chunks, yielding between chunks
    Batch,
    /// Left in place; `get_checked` deletes on read
    Lazy,
    /// Never touched
    Never,
}

impl CleanupStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStrategy::Immediate => "immediate",
            CleanupStrategy::Batch => "batch",
            CleanupStrategy::Lazy => "lazy",
            CleanupStrategy::Never => "never",
        }
    }
}

impl fmt::Display for CleanupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CleanupRule {
    pub name: String,
    pub pattern: KeyPattern,
    pub ttl: Duration,
    pub strategy: CleanupStrategy,
    pub batch_size: usize,
    /// Higher runs first and owns overlapping keys
    pub priority: u32,
}

impl CleanupRule {
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        ttl: Duration,
        strategy: CleanupStrategy,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            pattern: KeyPattern::new(pattern)?,
            ttl,
            strategy,
            batch_size: 100,
            priority: 0,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[inline]
    pub fn matches(&self, key: &str) -> bool {
        self.pattern.matches(key)
    }
}

/// Sort so the first match is the owning rule
pub fn sort_rules(rules: &mut [CleanupRule]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
}

/// Rules for every namespace the coordination core writes.
///
/// Saga step and compensation claims live as long as the saga record
/// (`saga_record_ttl_secs`) so recovery can still reuse completed steps.
pub fn default_rules(config: &CleanupConfig, saga_record_ttl_secs: u64) -> Result<Vec<CleanupRule>> {
    use CleanupStrategy::*;

    let saga_ttl = saga_record_ttl_secs;
    let specs: [(&str, &str, u64, CleanupStrategy, usize, u32); 12] = [
        ("leader_election", "leader_election:*", 0, Never, 1, 1000),
        ("saga_step_claim", "idempotency:saga:*", saga_ttl, Batch, 500, 110),
        ("saga_compensation_claim", "idempotency:saga_compensation:*", saga_ttl, Batch, 500, 110),
        ("idempotency", "idempotency:*", DAY, Batch, 500, 100),
        ("job_claim", "job_claim:*", DAY, Immediate, 100, 90),
        ("job_execution", "job_execution:*", DAY, Batch, 200, 80),
        ("job_result", "job_result:*", 7 * DAY, Batch, 200, 70),
        ("saga", "saga:*", 7 * DAY, Batch, 100, 60),
        ("saga_result", "saga_result:*", 30 * DAY, Batch, 100, 50),
        ("saga_compensation", "saga_compensation:*", 7 * DAY, Batch, 100, 50),
        ("session", "session:*", DAY, Lazy, 100, 20),
        ("cache", "cache:*", HOUR, Immediate, 500, 10),
    ];

    let mut rules = specs
        .into_iter()
        .map(|(name, pattern, ttl, strategy, batch, priority)| {
            let ttl = config.ttl_overrides.get(name).copied().unwrap_or(ttl);
            CleanupRule::new(name, pattern, Duration::from_secs(ttl), strategy)
                .map(|r| r.with_batch_size(batch).with_priority(priority))
        })
        .collect::<Result<Vec<_>>>()?;
    sort_rules(&mut rules);
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_cover_namespaces() {
        let rules = default_rules(&CleanupConfig::default(), 7 * DAY).unwrap();
        for key in [
            "session:abc",
            "idempotency:withdraw:u1:ff",
            "job_claim:fp",
            "job_execution:01H",
            "job_result:fp",
            "saga:01H",
            "saga_result:01H",
            "cache:balance:u1:USD",
            "leader_election:svc:leader",
        ] {
            assert!(rules.iter().any(|r| r.matches(key)), "{} uncovered", key);
        }
        assert_eq!(rules[0].name, "leader_election");
        assert_eq!(rules[0].strategy, CleanupStrategy::Never);
    }

    #[test]
    fn test_saga_step_claims_outlive_generic_idempotency() {
        let saga_ttl = 7 * DAY;
        let rules = default_rules(&CleanupConfig::default(), saga_ttl).unwrap();
        let owner = |key: &str| rules.iter().find(|r| r.matches(key)).unwrap();

        let step = owner("idempotency:saga:01H:reserve");
        assert_eq!(step.name, "saga_step_claim");
        assert_eq!(step.ttl, Duration::from_secs(saga_ttl));
        let comp = owner("idempotency:saga_compensation:01H:reserve");
        assert_eq!(comp.name, "saga_compensation_claim");
        assert_eq!(comp.ttl, Duration::from_secs(saga_ttl));
        assert_eq!(owner("idempotency:withdraw:u1:ff").ttl, Duration::from_secs(DAY));
    }

    #[test]
    fn test_ttl_override() {
        let mut config = CleanupConfig::default();
        config.ttl_overrides.insert("cache".to_string(), 60);
        let rules = default_rules(&config, 7 * DAY).unwrap();
        let cache = rules.iter().find(|r| r.name == "cache").unwrap();
        assert_eq!(cache.ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_priority_order() {
        let mut rules = vec![
            CleanupRule::new("low", "a:*", Duration::from_secs(1), CleanupStrategy::Batch)
                .unwrap()
                .with_priority(1),
            CleanupRule::new("high", "a:b:*", Duration::from_secs(1), CleanupStrategy::Never)
                .unwrap()
                .with_priority(9),
        ];
        sort_rules(&mut rules);
        let owner = rules.iter().find(|r| r.matches("a:b:c")).unwrap();
        assert_eq!(owner.name, "high");
    }
}
