//! Wire format and broadcast event types.
//!
//! All event types derive `serde::Serialize` + `serde::Deserialize` so a host
//! can forward them as JSON unchanged.

pub mod events;
pub mod wire;
