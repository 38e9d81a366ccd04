//! Idle episode tracking and due-action scheduling

mod scheduler;
mod tracker;

pub use scheduler::ActionScheduler;
pub use tracker::{CommitResult, StateTracker, TrackerUpdate, Transition};
