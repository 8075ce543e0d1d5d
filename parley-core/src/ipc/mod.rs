//! Lifecycle types exposed to callers.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them over its own IPC or websocket layer unchanged.

pub mod events;
