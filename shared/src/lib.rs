//! Wire model shared by the agent and the collector.
//!
//! * [`kernel`]  – frames coming off the minifilter port (tagged variants).
//! * [`event`]   – the normalized event every consumer sees, plus its JSON form.
//! * [`record`]  – fixed-size binary form of a normalized event.
//! * [`framing`] – opcode/length framing used on the agent ↔ collector link.

pub mod constants;
pub mod cursor;
pub mod event;
pub mod framing;
pub mod kernel;
pub mod record;
pub mod utf16;
