//! Telemetry for axiom: console logging setup and the append-only event log.

pub mod event_log;
pub mod logging;
