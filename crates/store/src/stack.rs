use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{RuleSet, RuleSetError};

/// Lifecycle of a deployed stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StackState {
    Stopped,
    Starting,
    Running,
    Redeploying,
}

impl StackState {
    pub const ALL: [StackState; 4] = [StackState::Stopped, StackState::Starting, StackState::Running, StackState::Redeploying];

    pub fn as_str(self) -> &'static str {
        match self {
            StackState::Stopped => "Stopped",
            StackState::Starting => "Starting",
            StackState::Running => "Running",
            StackState::Redeploying => "Redeploying",
        }
    }

    /// An orchestration run currently owns the stack.
    pub fn is_busy(self) -> bool { matches!(self, StackState::Starting | StackState::Redeploying) }
}

impl std::fmt::Display for StackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for StackState {
    type Err = RuleSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StackState::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RuleSetError::UnknownState { from: s.to_string(), to: s.to_string(), state: s.to_string() })
    }
}

/// Stack topology: Stopped <-> Starting -> Running <-> Redeploying, with
/// Running and Redeploying both able to stop and Redeploying able to restart
/// from scratch. No state loops onto itself.
pub fn stack_rules() -> RuleSet {
    use StackState::*;
    let edges = [
        (Stopped, Starting),
        (Starting, Running),
        (Starting, Stopped),
        (Running, Stopped),
        (Running, Redeploying),
        (Redeploying, Running),
        (Redeploying, Starting),
        (Redeploying, Stopped),
    ];
    let builder = edges
        .into_iter()
        .fold(RuleSet::builder().states(StackState::ALL.map(StackState::as_str)), |b, (from, to)| {
            b.allow(from.as_str(), to.as_str())
        });
    match builder.build() {
        Ok(rules) => rules,
        Err(e) => unreachable!("stack rule set is statically valid: {e}"),
    }
}
