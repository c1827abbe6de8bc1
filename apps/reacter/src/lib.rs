//! reacter - an agent-style service monitoring daemon.
//!
//! The check engine runs external probe commands on an interval, classifies
//! their exit status into a small state space, debounces transient failures
//! and detects flapping, then emits one JSON event per execution. The event
//! router consumes those newline-delimited events and dispatches each one to
//! every handler whose predicate matches, as an external command fed through
//! a `REACTER_*` environment contract.

pub mod checks;
pub mod config;
pub mod error;
pub mod handlers;
