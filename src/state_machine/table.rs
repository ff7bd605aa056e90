//! Transition tables
//!
//! A table is built once per entity type and validated at build time: every
//! state referenced by an edge must be declared, terminal states have no
//! regular outgoing edges, and at least one initial state exists.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionTable {
    entity_type: String,
    states: BTreeSet<String>,
    initial: BTreeSet<String>,
    edges: BTreeMap<String, BTreeSet<String>>,
    /// Only usable with an admin override
    admin_edges: BTreeMap<String, BTreeSet<String>>,
    terminal: BTreeSet<String>,
    financial: BTreeSet<String>,
}

impl TransitionTable {
    pub fn builder(entity_type: impl Into<String>) -> TransitionTableBuilder {
        TransitionTableBuilder {
            table: TransitionTable {
                entity_type: entity_type.into(),
                states: BTreeSet::new(),
                initial: BTreeSet::new(),
                edges: BTreeMap::new(),
                admin_edges: BTreeMap::new(),
                terminal: BTreeSet::new(),
                financial: BTreeSet::new(),
            },
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(String::as_str)
    }

    pub fn is_declared(&self, state: &str) -> bool {
        self.states.contains(state)
    }

    /// Valid target of the `null ->` row
    pub fn is_initial(&self, state: &str) -> bool {
        self.initial.contains(state)
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal.contains(state)
    }

    /// Entering this state moves money
    pub fn is_financial(&self, state: &str) -> bool {
        self.financial.contains(state)
    }

    /// Regular edge check. `from == to` only passes for a declared self-loop.
    pub fn can_transition(&self, from: &str, to: &str) -> bool {
        self.edges.get(from).is_some_and(|t| t.contains(to))
    }

    pub fn admin_can_transition(&self, from: &str, to: &str) -> bool {
        self.admin_edges.get(from).is_some_and(|t| t.contains(to))
    }

    /// Regular targets from `state`, sorted
    pub fn allowed_from(&self, state: &str) -> Vec<String> {
        self.edges
            .get(state)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct TransitionTableBuilder {
    table: TransitionTable,
}

fn owned<'a>(states: &'a [&'a str]) -> impl Iterator<Item = String> + 'a {
    states.iter().map(|s| s.to_string())
}

impl TransitionTableBuilder {
    pub fn states(mut self, states: &[&str]) -> Self {
        self.table.states.extend(owned(states));
        self
    }

    pub fn initial(mut self, states: &[&str]) -> Self {
        self.table.initial.extend(owned(states));
        self
    }

    pub fn allow(mut self, from: &str, to: &[&str]) -> Self {
        self.table
            .edges
            .entry(from.to_string())
            .or_default()
            .extend(owned(to));
        self
    }

    pub fn admin_allow(mut self, from: &str, to: &[&str]) -> Self {
        self.table
            .admin_edges
            .entry(from.to_string())
            .or_default()
            .extend(owned(to));
        self
    }

    pub fn terminal(mut self, states: &[&str]) -> Self {
        self.table.terminal.extend(owned(states));
        self
    }

    pub fn financial(mut self, states: &[&str]) -> Self {
        self.table.financial.extend(owned(states));
        self
    }

    pub fn build(self) -> Result<TransitionTable> {
        let t = self.table;
        let undeclared = |s: &String| !t.states.contains(s);
        let invalid = |msg: String| {
            Err(CoreError::Config(format!(
                "transition table {}: {}",
                t.entity_type, msg
            )))
        };

        if t.initial.is_empty() {
            return invalid("no initial state".to_string());
        }
        for set in [&t.initial, &t.terminal, &t.financial] {
            if let Some(s) = set.iter().find(|s| undeclared(*s)) {
                return invalid(format!("undeclared state {}", s));
            }
        }
        for edges in [&t.edges, &t.admin_edges] {
            for (from, targets) in edges {
                if undeclared(from) {
                    return invalid(format!("undeclared state {}", from));
                }
                if let Some(s) = targets.iter().find(|s| undeclared(*s)) {
                    return invalid(format!("undeclared state {} (from {})", s, from));
                }
            }
        }
        if let Some(s) = t
            .terminal
            .iter()
            .find(|s| t.edges.get(*s).is_some_and(|e| !e.is_empty()))
        {
            return invalid(format!("terminal state {} has outgoing edges", s));
        }
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> TransitionTableBuilder {
        TransitionTable::builder("demo")
            .states(&["NEW", "OPEN", "DONE"])
            .initial(&["NEW"])
            .allow("NEW", &["OPEN"])
            .allow("OPEN", &["OPEN", "DONE"])
            .terminal(&["DONE"])
    }

    #[test]
    fn test_edges_and_self_loop() {
        let t = small().build().unwrap();
        assert!(t.can_transition("NEW", "OPEN"));
        assert!(!t.can_transition("NEW", "NEW"));
        assert!(t.can_transition("OPEN", "OPEN"));
        assert!(!t.can_transition("NEW", "DONE"));
        assert_eq!(t.allowed_from("OPEN"), vec!["DONE", "OPEN"]);
        assert!(t.allowed_from("DONE").is_empty());
    }

    #[test]
    fn test_undeclared_state_rejected() {
        let err = small().allow("OPEN", &["GONE"]).build().unwrap_err();
        assert!(err.to_string().contains("GONE"));
        assert!(small().financial(&["PAID"]).build().is_err());
    }

    #[test]
    fn test_terminal_cannot_have_regular_edges() {
        assert!(small().allow("DONE", &["OPEN"]).build().is_err());
        // Admin edges out of terminal states are fine
        let t = small().admin_allow("DONE", &["OPEN"]).build().unwrap();
        assert!(t.admin_can_transition("DONE", "OPEN"));
        assert!(!t.can_transition("DONE", "OPEN"));
    }

    #[test]
    fn test_requires_initial_state() {
        let err = TransitionTable::builder("x")
            .states(&["A"])
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
