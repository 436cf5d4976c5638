//! Trigger keepers: predicates and the matching/submission engine.

pub mod engine;
pub mod predicate;

pub use engine::{TriggerEngine, TriggerMode, TriggerOrder};
