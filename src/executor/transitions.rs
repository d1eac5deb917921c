//! Finite status lifecycles for durable entities.
//!
//! A handler verifies the requested transition against the entity's declared
//! flow before staging a status write. Rejecting an illegal transition with a
//! conflict is the pipeline's substitute for field-level merge: a stale
//! client cannot, for example, re-approve an already-rejected record.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::core::{Result, SyncError};

/// Declares the statuses an entity may hold and the transitions between
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFlow {
    initial: String,
    transitions: HashMap<String, HashSet<String>>,
}

impl StatusFlow {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            initial: initial.into(),
            transitions: HashMap::new(),
        }
    }

    /// Allows a `from → to` transition. Builder-style.
    pub fn allow(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.transitions
            .entry(from.into())
            .or_default()
            .insert(to.into());
        self
    }

    /// The workflow lifecycle shipped for field-operations records:
    /// draft → submitted → approved | rejected, approved → completed, a
    /// rejected record may be resubmitted, and terminal records may be
    /// archived.
    pub fn standard() -> Self {
        Self::new("draft")
            .allow("draft", "submitted")
            .allow("submitted", "approved")
            .allow("submitted", "rejected")
            .allow("approved", "completed")
            .allow("rejected", "submitted")
            .allow("completed", "archived")
            .allow("rejected", "archived")
    }

    /// Status assigned to newly created entities when the command does not
    /// name one.
    pub fn initial_status(&self) -> &str {
        &self.initial
    }

    pub fn can(&self, from: &str, to: &str) -> bool {
        self.transitions
            .get(from)
            .map(|targets| targets.contains(to))
            .unwrap_or(false)
    }

    /// Fails with a conflict (surfaced to the user as "state changed
    /// elsewhere") when the current status does not permit the requested
    /// transition.
    pub fn ensure_transition(&self, current: &str, requested: &str) -> Result<()> {
        if self.can(current, requested) {
            return Ok(());
        }
        Err(SyncError::Conflict(format!(
            "status transition '{}' -> '{}' is not allowed",
            current, requested
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_flow_permits_the_happy_path() {
        let flow = StatusFlow::standard();
        assert_eq!(flow.initial_status(), "draft");
        flow.ensure_transition("draft", "submitted").unwrap();
        flow.ensure_transition("submitted", "approved").unwrap();
        flow.ensure_transition("approved", "completed").unwrap();
        flow.ensure_transition("completed", "archived").unwrap();
    }

    #[test]
    fn standard_flow_allows_resubmission_after_rejection() {
        let flow = StatusFlow::standard();
        flow.ensure_transition("submitted", "rejected").unwrap();
        flow.ensure_transition("rejected", "submitted").unwrap();
    }

    #[test]
    fn illegal_transitions_fail_with_conflict() {
        let flow = StatusFlow::standard();
        let err = flow.ensure_transition("completed", "approved").unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));

        let err = flow.ensure_transition("draft", "approved").unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));
    }

    #[test]
    fn custom_flow_only_knows_declared_edges() {
        let flow = StatusFlow::new("open")
            .allow("open", "closed")
            .allow("closed", "open");
        assert!(flow.can("open", "closed"));
        assert!(!flow.can("open", "archived"));
    }
}
