//! Watchdog for an in-memory database.
//!
//! The sitter runs a tracking cycle every few seconds: CPU load, a ping
//! under a deadline, configured threshold rules and a plan-change analysis.
//! The first anomaly triggers a recording episode that captures stacks,
//! dumps, profiler traces and query output before the evidence is gone.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Configuration loading and validation.
pub mod config;
/// Probes run under a deadline with one in-flight slot per category.
pub mod deadline;
/// Plan and engine change regression analysis.
pub mod plan;
/// CPU sampling, ping and the online precondition.
pub mod probes;
/// Recording episodes and the console recorder.
pub mod recorder;
/// Check records, escalation e-mails and the feature log.
pub mod reporter;
/// Age-based cleanup of artifacts and logs.
pub mod retention;
/// Feature threshold rules.
pub mod rules;
/// Hosts targeted by a recording.
pub mod scope;
/// Cancelling or disconnecting sessions.
pub mod sessions;
/// The tracking cycle.
pub mod tracker;
