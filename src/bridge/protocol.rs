//! # Wire Protocols
//!
//! Message types for the two sockets a call is bridged across.
//!
//! ## Telephony Media Stream:
//! JSON events tagged by an `event` field (`start` / `media` / `stop`),
//! with base64 mu-law audio in `media.payload` and the provider's stream
//! identifier in `streamSid`. The `start` event may carry custom parameters
//! set in the webhook markup, including a provisional session id.
//!
//! ## Agent Conversation:
//! JSON events tagged by a `type` field: session initiation, audio chunks
//! in both directions, streaming transcripts, lifecycle events, and
//! application-level ping/pong.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Messages on the telephony media-stream socket (both directions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyMessage {
    /// Stream opened; carries the stream id and webhook-defined parameters.
    #[serde(rename = "start")]
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        #[serde(default)]
        start: Option<StartInfo>,
    },

    /// One audio frame. Inbound frames carry caller audio; outbound frames
    /// (tagged with the recorded stream id) carry agent audio.
    #[serde(rename = "media")]
    Media {
        #[serde(rename = "streamSid", default, skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        media: MediaPayload,
    },

    /// The provider closed the stream (caller hangup or redirect).
    #[serde(rename = "stop")]
    Stop {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
}

/// Metadata delivered with the `start` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartInfo {
    #[serde(rename = "callSid", default)]
    pub call_sid: Option<String>,
    /// Parameters defined in the webhook markup (`<Parameter>` elements).
    #[serde(rename = "customParameters", default)]
    pub custom_parameters: HashMap<String, String>,
}

/// Base64 audio carried by a `media` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
}

/// Messages on the agent conversation socket (both directions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Session-initiation handshake, sent after every (re)connect so the
    /// agent re-establishes conversational context.
    ConversationInitiationClientData {
        conversation_config: ConversationConfig,
    },

    /// Agent acknowledges the session and reports its audio format.
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: InitiationMetadata,
    },

    /// Caller audio toward the agent.
    UserAudioChunk { user_audio_chunk: String },

    /// Agent audio toward the caller.
    Audio { audio_event: AudioEvent },

    /// Streaming transcript of caller speech.
    UserTranscript {
        user_transcription_event: UserTranscription,
    },

    /// Streaming transcript of the agent's reply.
    AgentResponse {
        agent_response_event: AgentResponseEvent,
    },

    /// Application-level heartbeat.
    Ping { ping_event: PingEvent },
    Pong { pong_event: PingEvent },

    /// The agent finished the conversation normally.
    ConversationEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Unrecoverable agent-side failure.
    Error { error_event: ErrorEvent },
}

/// Handshake payload identifying the agent and the audio formats in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    pub agent_id: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitiationMetadata {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub agent_output_audio_format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioEvent {
    pub audio_base_64: String,
    #[serde(default)]
    pub event_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTranscription {
    pub user_transcript: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponseEvent {
    pub agent_response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingEvent {
    pub event_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}
