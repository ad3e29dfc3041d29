//! # Connection Resilience
//!
//! Everything that keeps a live call alive through AI-side failures.
//!
//! ## Key Components:
//! - **Supervisor**: per-call reconnect state machine with exponential
//!   backoff bounded by both an attempt count and a total recovery budget
//! - **Link**: the tokio task owning one agent WebSocket, bridged to the
//!   call actor through command/event channels
//! - **Circuit Breaker**: process-wide failure aggregator that fails fast
//!   once a threshold of AI-side failures is crossed
//! - **Fallback Controller**: the last resort, redirecting the live call into a
//!   human-staffed conference

pub mod circuit;     // Process-wide failure aggregation
pub mod fallback;    // Redirect to a human conference
pub mod link;        // Agent WebSocket task and handle
pub mod supervisor;  // Reconnect/backoff state machine
