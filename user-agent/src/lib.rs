// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point. Re-export everything for both binaries and the
// integration tests.

pub mod macros;

pub mod comms;
pub mod config;
pub mod db;
pub mod detect;
pub mod enrich;
pub mod introspect;
pub mod logging;
pub mod pipeline;
pub mod telemetry;
pub mod transport;
