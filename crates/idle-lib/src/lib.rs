//! Idle resource lifecycle management for research compute instances
//!
//! This crate provides the core of the idle manager:
//! - Policy catalog and idle classification
//! - Per-instance idle episode tracking and due-action scheduling
//! - Action execution against a lifecycle controller
//! - Append-only action history and durable state
//! - Health checks and observability
//!
//! The core owns no background tasks; a driver such as `idled` feeds it
//! metrics and triggers sweeps.

pub mod action;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod history;
pub mod idle;
pub mod manager;
pub mod models;
pub mod observability;
pub mod policy;
pub mod sampler;
pub mod store;

pub use action::{LifecycleController, NotificationSink, Severity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ManagerConfig;
pub use error::{IdleError, Result};
pub use health::{Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthReport, Readiness};
pub use manager::{Manager, ManagerBuilder, SweepReport};
pub use models::*;
pub use observability::{IdleMetrics, StructuredLogger};
pub use policy::{IdlePolicy, InstanceOverride, PolicyConfig, Thresholds};
pub use sampler::MetricsProvider;
