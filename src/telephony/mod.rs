//! # Telephony Provider Integration
//!
//! The narrow interfaces to the telephony provider:
//!
//! - **Client**: REST call control (place, redirect, query) with credential
//!   sanitization and validation up front
//! - **Webhook**: HMAC signature verification for inbound call-control
//!   webhooks, and the markup responses that tell the provider to open a
//!   media stream or dial a conference

pub mod client;   // Call-control REST client
pub mod webhook;  // Signature verification and markup responses
