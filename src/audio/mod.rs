//! # Audio Processing Module
//!
//! Frame-level audio handling for the call bridge.
//!
//! ## Key Components:
//! - **Transcoder**: stateless per-frame conversion between the telephony
//!   leg (8-bit mu-law, 8kHz) and the agent leg (16-bit linear PCM, 16kHz)
//! - **Message Queue**: bounded, time-expiring FIFO for outbound agent
//!   messages while the agent connection is unavailable
//!
//! ## Audio Format Notes:
//! The telephony media stream always carries base64 G.711 mu-law at 8kHz
//! mono. The agent socket speaks either the same mu-law format (no
//! conversion) or 16kHz 16-bit little-endian PCM, in which case every frame
//! is transcoded in both directions.

pub mod queue;      // Bounded, expiring outbound buffer
pub mod transcode;  // G.711 mu-law <-> linear PCM conversion

pub use transcode::AudioFormat;
