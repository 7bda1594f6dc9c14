//! Agent ↔ collector link over the opcode/length framing in
//! [`shared::framing`].

pub mod backoff;
pub mod client;
pub mod server;

pub use backoff::Backoff;
pub use client::{CommandHandler, ConnectionState, TransportClient, TransportError, TransportHandle};
pub use server::{AgentRegistry, BAD_JSON_REPLY, CollectorServer, Inbound};
