use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleSetError {
    #[error("rule set declares no states")]
    Empty,
    #[error("transition {from} -> {to} names undeclared state {state}")]
    UnknownState { from: String, to: String, state: String },
    #[error("self transition {0} -> {0} must be declared with self_loop")]
    SelfLoop(String),
}

/// Allowed `from -> to` transitions for one resource kind.
///
/// Absence of an edge means "not allowed". Self transitions exist only when
/// declared with [`RuleSetBuilder::self_loop`].
#[derive(Debug, Clone)]
pub struct RuleSet {
    states: Vec<String>,
    allowed: FxHashMap<String, FxHashSet<String>>,
}

impl RuleSet {
    pub fn builder() -> RuleSetBuilder { RuleSetBuilder::default() }

    /// Pure lookup, no side effects.
    pub fn can_transition(&self, from: &str, to: &str) -> bool {
        self.allowed.get(from).map(|targets| targets.contains(to)).unwrap_or(false)
    }

    pub fn contains(&self, state: &str) -> bool { self.states.iter().any(|s| s == state) }

    /// Declared states in declaration order.
    pub fn states(&self) -> &[String] { &self.states }

    /// Allowed targets from `from`, sorted.
    pub fn targets(&self, from: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self.allowed.get(from).map(|t| t.iter().map(String::as_str).collect()).unwrap_or_default();
        out.sort_unstable();
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleSetBuilder {
    states: Vec<String>,
    edges: Vec<(String, String)>,
    self_loops: Vec<String>,
}

impl RuleSetBuilder {
    pub fn state(mut self, state: impl Into<String>) -> Self {
        let s = state.into();
        if !self.states.contains(&s) { self.states.push(s); }
        self
    }

    pub fn states<I, S>(self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        states.into_iter().fold(self, |b, s| b.state(s))
    }

    pub fn allow(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Explicitly permit `state -> state`.
    pub fn self_loop(mut self, state: impl Into<String>) -> Self {
        self.self_loops.push(state.into());
        self
    }

    pub fn build(self) -> Result<RuleSet, RuleSetError> {
        if self.states.is_empty() {
            return Err(RuleSetError::Empty);
        }
        let declared: FxHashSet<&str> = self.states.iter().map(String::as_str).collect();
        let mut allowed: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();
        for (from, to) in &self.edges {
            for s in [from, to] {
                if !declared.contains(s.as_str()) {
                    return Err(RuleSetError::UnknownState { from: from.clone(), to: to.clone(), state: s.clone() });
                }
            }
            if from == to {
                return Err(RuleSetError::SelfLoop(from.clone()));
            }
            allowed.entry(from.clone()).or_default().insert(to.clone());
        }
        for s in &self.self_loops {
            if !declared.contains(s.as_str()) {
                return Err(RuleSetError::UnknownState { from: s.clone(), to: s.clone(), state: s.clone() });
            }
            allowed.entry(s.clone()).or_default().insert(s.clone());
        }
        Ok(RuleSet { states: self.states, allowed })
    }
}
