//! Cache invalidation registry
//!
//! Two sources of "X changed, drop Y":
//! - pattern rules: a trigger glob maps to target globs; `$1..` in a target is
//!   replaced by the trigger's captures (`balance:*` => `cache:balance:$1:*`)
//! - explicit dependencies between concrete keys, followed transitively

use std::collections::{HashMap, HashSet, VecDeque};

use crate::coordination::KeyPattern;
use crate::coordination::pattern::substitute;
use crate::error::Result;

#[derive(Debug, Clone)]
struct InvalidationRule {
    trigger: KeyPattern,
    targets: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InvalidationRegistry {
    rules: Vec<InvalidationRule>,
    dependencies: HashMap<String, Vec<String>>,
}

impl InvalidationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derived balance caches follow their balance key
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        registry.register_pattern("balance:*", &["cache:balance:$1:*"])?;
        Ok(registry)
    }

    pub fn register_pattern(&mut self, trigger: &str, targets: &[&str]) -> Result<()> {
        for t in targets {
            // Validate the template as a pattern up front
            KeyPattern::new(t)?;
        }
        self.rules.push(InvalidationRule {
            trigger: KeyPattern::new(trigger)?,
            targets: targets.iter().map(|t| t.to_string()).collect(),
        });
        Ok(())
    }

    /// `dependent` is dropped whenever `key` changes
    pub fn add_dependency(&mut self, key: impl Into<String>, dependent: impl Into<String>) {
        let deps = self.dependencies.entry(key.into()).or_default();
        let dependent = dependent.into();
        if !deps.contains(&dependent) {
            deps.push(dependent);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.dependencies.is_empty()
    }

    /// Globs and concrete keys to delete after `key` changed. The changed key
    /// itself is never included.
    pub fn expand(&self, key: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut emitted = HashSet::new();
        let mut visited = HashSet::from([key.to_string()]);
        let mut queue = VecDeque::from([key.to_string()]);

        while let Some(current) = queue.pop_front() {
            for rule in &self.rules {
                if let Some(caps) = rule.trigger.captures(&current) {
                    for t in &rule.targets {
                        let target = substitute(t, &caps);
                        if target != key && emitted.insert(target.clone()) {
                            out.push(target);
                        }
                    }
                }
            }
            for dep in self.dependencies.get(&current).into_iter().flatten() {
                if visited.insert(dep.clone()) {
                    if emitted.insert(dep.clone()) {
                        out.push(dep.clone());
                    }
                    queue.push_back(dep.clone());
                }
            }
        }
        out
    }
}

/// True if `target` must be resolved with a scan
pub fn is_glob(target: &str) -> bool {
    target.contains('*') || target.contains('?')
}
