//! Sequence execution engine for time-delayed, branching outbound email
//! sequences with A/B tested content and trigger-driven enrollment.
//!
//! The engine advances each enrollment through its sequence's step graph
//! when its scheduled time arrives. Side effects go through the
//! collaborator traits in [`collaborators`]; [`memory`] provides in-process
//! implementations.

pub mod collaborators;
pub mod condition;
pub mod demo;
pub mod engine;
pub mod executor;
pub mod memory;
pub mod render;
pub mod schedule;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod testing;
pub mod trigger;
pub mod types;
pub mod variant;

pub use ab_test::{AbDecision, AbTestEvaluator, NewAbTest};
pub use collaborators::Collaborators;
pub use engine::{EngineSettings, SequenceEngine};
pub use scheduler::SequenceScheduler;
pub use trigger::{NewTrigger, TriggerMatcher, TriggerReport};
