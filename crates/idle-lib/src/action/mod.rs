//! Idle action execution
//!
//! The executor turns a `PendingAction` into lifecycle calls and reports the
//! outcome; committing the result to state and history is the manager's job.

mod executor;
mod lifecycle;

pub use executor::{ActionExecutor, ExecutionReport, InFlightGuard};
pub use lifecycle::{LifecycleController, NotificationSink, Severity};
