use std::sync::Arc;

use amp_core::{StateStore, StoreError};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::RuleSet;

/// Key prefix for state records.
pub const STATE_PREFIX: &str = "states/";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("state already exists for {0}")]
    AlreadyExists(String),
    #[error("no state recorded for {0}")]
    NotFound(String),
    #[error("{id}: transition {from} -> {to} is not allowed")]
    InvalidTransition { id: String, from: String, to: String },
    /// Another writer changed the record between our read and our write.
    #[error("{id}: state changed concurrently (expected {expected}, found {actual}); re-read and retry")]
    Conflict { id: String, expected: String, actual: String },
    #[error("{0} is not a declared state")]
    UnknownState(String),
    #[error("state store: {0}")]
    Store(String),
}

impl StateError {
    /// Lost a race; the transition may still be valid after re-reading.
    pub fn is_conflict(&self) -> bool { matches!(self, StateError::Conflict { .. }) }

    fn from_store(id: &str, e: StoreError) -> Self {
        match e {
            StoreError::AlreadyExists(_) => StateError::AlreadyExists(id.to_string()),
            StoreError::NotFound(_) => StateError::NotFound(id.to_string()),
            StoreError::Conflict { expected, actual, .. } => StateError::Conflict { id: id.to_string(), expected, actual },
            StoreError::Backend(msg) => StateError::Store(msg),
        }
    }
}

/// Lifecycle state machine persisted in a [`StateStore`].
///
/// Holds no in-process locks: correctness comes entirely from the store's
/// compare-and-set, so several machines in several processes may share one
/// store.
#[derive(Clone)]
pub struct StateMachine {
    store: Arc<dyn StateStore>,
    rules: Arc<RuleSet>,
    prefix: String,
}

impl StateMachine {
    pub fn new(store: Arc<dyn StateStore>, rules: RuleSet) -> Self {
        Self { store, rules: Arc::new(rules), prefix: STATE_PREFIX.to_string() }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn rules(&self) -> &RuleSet { &self.rules }

    fn key(&self, id: &str) -> String { format!("{}{}", self.prefix, id) }

    pub async fn create_state(&self, id: &str, initial: &str) -> Result<(), StateError> {
        if !self.rules.contains(initial) {
            return Err(StateError::UnknownState(initial.to_string()));
        }
        self.store.create(&self.key(id), initial).await.map_err(|e| StateError::from_store(id, e))?;
        info!(id = %id, state = %initial, "state created");
        Ok(())
    }

    pub async fn get_state(&self, id: &str) -> Result<String, StateError> {
        match self.store.get(&self.key(id)).await.map_err(|e| StateError::from_store(id, e))? {
            Some(v) => Ok(v),
            None => Err(StateError::NotFound(id.to_string())),
        }
    }

    pub fn can_transition(&self, from: &str, to: &str) -> bool { self.rules.can_transition(from, to) }

    /// Move `id` to `to`; returns the state it left.
    ///
    /// The write is a compare-and-set against the value read at the start,
    /// so a concurrent writer makes this fail with `Conflict` rather than
    /// silently succeed. Nothing is written when the transition is invalid.
    pub async fn transition_to(&self, id: &str, to: &str) -> Result<String, StateError> {
        if !self.rules.contains(to) {
            return Err(StateError::UnknownState(to.to_string()));
        }
        let current = self.get_state(id).await?;
        self.transition_from(id, &current, to).await?;
        Ok(current)
    }

    /// Move `id` from `from` to `to`, failing with `Conflict` unless the
    /// record still holds `from`.
    pub async fn transition_from(&self, id: &str, from: &str, to: &str) -> Result<(), StateError> {
        if !self.rules.contains(to) {
            return Err(StateError::UnknownState(to.to_string()));
        }
        if !self.can_transition(from, to) {
            counter!("state_invalid_transition_total", 1u64);
            return Err(StateError::InvalidTransition { id: id.to_string(), from: from.to_string(), to: to.to_string() });
        }
        match self.store.compare_and_set(&self.key(id), from, to).await {
            Ok(()) => {
                counter!("state_transition_total", 1u64);
                info!(id = %id, from = %from, to = %to, "state transition");
                Ok(())
            }
            Err(e) => {
                let err = StateError::from_store(id, e);
                if err.is_conflict() {
                    counter!("state_conflict_total", 1u64);
                    debug!(id = %id, from = %from, to = %to, "transition lost compare-and-set race");
                }
                Err(err)
            }
        }
    }

    /// `transition_to`, re-reading and retrying up to `attempts` times when a
    /// concurrent writer wins. Invalid transitions are never retried.
    pub async fn transition_retrying(&self, id: &str, to: &str, attempts: usize) -> Result<String, StateError> {
        let attempts = attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.transition_to(id, to).await {
                Err(e) if e.is_conflict() => {
                    warn!(id = %id, to = %to, attempt, "transition conflict; retrying");
                    last = Some(e);
                }
                other => return other,
            }
        }
        Err(last.unwrap_or_else(|| StateError::Store("no transition attempt made".into())))
    }

    /// Remove the record. Deleting an absent id surfaces `NotFound`.
    pub async fn delete_state(&self, id: &str) -> Result<(), StateError> {
        self.store.delete(&self.key(id)).await.map_err(|e| StateError::from_store(id, e))?;
        info!(id = %id, "state deleted");
        Ok(())
    }
}
