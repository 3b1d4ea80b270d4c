//! AMP lifecycle state machine.
//!
//! A `StateMachine` keeps one record per resource id in a `StateStore` and
//! only moves it along edges of a `RuleSet`. Every transition is a
//! read followed by a compare-and-set against the value just read, so
//! concurrent writers (other processes, other CLI invocations) can never race
//! a resource into an undeclared state: the loser gets `StateError::Conflict`.

#![forbid(unsafe_code)]

mod machine;
mod memory;
mod rules;
mod stack;

pub use machine::{StateError, StateMachine, STATE_PREFIX};
pub use memory::MemoryStateStore;
pub use rules::{RuleSet, RuleSetBuilder, RuleSetError};
pub use stack::{stack_rules, StackState};
