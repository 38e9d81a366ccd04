//! idled: the idle manager daemon
//!
//! Wires the idle-lib core to its collaborators (metrics spool, control
//! plane, log notifications), drives it from a polling loop and exposes the
//! control API.

pub mod api;
pub mod config;
pub mod driver;
pub mod providers;
