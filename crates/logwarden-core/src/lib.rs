//! Core monitoring logic for logwarden: instance types, pattern
//! correlation, and the escalation state machine.
//!
//! Everything here is pure and synchronous: time enters as a
//! `DateTime<Utc>` parameter so state machines are testable without
//! sleeping. The runtime crate owns tasks, sockets, and timers.

pub mod config;
pub mod correlate;
pub mod escalate;
pub mod types;
