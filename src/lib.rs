//! Administrative toolkit for an in-memory database system.
//!
//! Shared plumbing for the `dbcleaner` housekeeping tool and the `sitter`
//! watchdog: the probe gateway, notification, topology, configuration and
//! logging.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod gateway;
pub mod housekeeping;
pub mod liveness;
pub mod logging;
pub mod notify;
pub mod topology;
