//! # Call Session Management
//!
//! In-memory state for live calls.
//!
//! ## Key Components:
//! - **Session**: the per-call record of configuration, lifecycle timestamps,
//!   transcript turn buffer, stream identifier, live agent link, quality
//!   snapshot, and call-type tag
//! - **Registry**: the exclusive owner of all sessions, keyed by call id
//!   with O(1) alias resolution for provisional ids and a periodic
//!   staleness sweep

pub mod registry;  // Session store with alias table
pub mod session;   // Per-call state and transcript assembly
