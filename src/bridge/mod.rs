//! # Stream Bridge
//!
//! The per-call orchestrator: pumps audio both ways between the telephony
//! media stream and the AI voice agent, assembles the transcript, and keeps
//! the call alive through agent-side disruptions.
//!
//! ## Key Components:
//! - **Protocol**: serde types for the telephony media-stream messages and
//!   the agent conversation messages
//! - **Machine**: the per-call state machine, a single `handle(event)` entry
//!   point returning the I/O actions to perform, testable with fake event
//!   sources instead of real sockets
//! - **Stream**: the actix WebSocket actor that hosts one call, owns its
//!   timers, and executes the machine's actions against the real sockets
//!
//! ## Message Flow:
//! Telephony frames arrive on the actor, are transcoded, and are forwarded
//! to the agent (or buffered while it is away); agent audio flows back
//! tagged with the call's stream id; transcript events accumulate into the
//! session's turn buffer.

pub mod machine;   // Per-call state machine
pub mod protocol;  // Wire message types for both sockets
pub mod stream;    // WebSocket actor hosting one call
