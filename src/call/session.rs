//! # Call Session State
//!
//! The per-call record owned by the registry for the lifetime of a call.
//!
//! ## Session Lifecycle:
//! 1. **Created**: on call initiation (webhook or outbound placement)
//! 2. **Active**: mutated by bridge event handlers as frames and
//!    transcripts arrive
//! 3. **Destroyed**: on termination, or by the periodic staleness sweep if
//!    a termination event was missed
//!
//! The transcript turn buffer is append-only and finalized exactly once;
//! per-speaker partial accumulators collect streaming transcript fragments
//! until a turn boundary flushes them into the buffer.

use crate::audio::AudioFormat;
use crate::resilience::link::AgentLink;
use crate::resilience::supervisor::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a call is routed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Bridge the caller to the conversational AI agent.
    AiPowered,
    /// Dial the caller straight into a plain conference, no AI leg.
    Direct,
}

/// Current routing of a live call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    AiPowered,
    Direct,
    /// The call was redirected to a human-staffed conference after an
    /// unrecoverable AI-side failure.
    Fallback,
}

impl CallType {
    pub fn as_str(&self) -> &str {
        match self {
            CallType::AiPowered => "ai_powered",
            CallType::Direct => "direct",
            CallType::Fallback => "fallback",
        }
    }
}

/// Who produced a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Caller,
    Agent,
}

impl Speaker {
    pub fn as_str(&self) -> &str {
        match self {
            Speaker::Caller => "caller",
            Speaker::Agent => "agent",
        }
    }
}

/// One completed utterance in the call transcript.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Coarse connection-quality label derived from heartbeat round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLabel {
    Unknown,
    Good,
    Degraded,
    Poor,
}

/// Live quality snapshot for a call's agent connection.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualitySnapshot {
    /// Most recent heartbeat round-trip time.
    pub rtt_ms: Option<u64>,
    /// Reconnections performed on this call so far.
    pub reconnects: u32,
    pub label: QualityLabel,
}

impl Default for QualitySnapshot {
    fn default() -> Self {
        Self {
            rtt_ms: None,
            reconnects: 0,
            label: QualityLabel::Unknown,
        }
    }
}

/// Per-call configuration, derived from the application config at creation.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub agent_audio_format: AudioFormat,
    pub mode: ExecutionMode,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_limit: u32,
    pub inactivity_timeout: Duration,
    pub connect_timeout: Duration,
    pub queue_max_depth: usize,
    pub queue_expiration: Duration,
    pub retry: RetryPolicy,
}

/// State for one live call.
///
/// Owned exclusively by the registry; the bridge, resilience layer, and
/// fallback controller mutate it through registry closures.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub config: SessionConfig,

    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,

    /// Ordered, append-only transcript of completed utterances.
    pub turns: Vec<ConversationTurn>,
    /// Streaming transcript fragments awaiting a turn boundary.
    pub caller_partial: String,
    pub agent_partial: String,
    pub transcript_finalized: bool,

    /// Telephony media-stream identifier, recorded from the `start` event.
    pub stream_sid: Option<String>,

    /// Live agent socket handle. `Some` only while the resilience layer
    /// reports the connection as up.
    pub agent_link: Option<AgentLink>,

    pub quality: QualitySnapshot,

    pub call_type: CallType,
    pub fallback_reason: Option<String>,
}

impl CallSession {
    pub fn new(call_id: String, config: SessionConfig) -> Self {
        let call_type = match config.mode {
            ExecutionMode::AiPowered => CallType::AiPowered,
            ExecutionMode::Direct => CallType::Direct,
        };
        let now = Utc::now();

        Self {
            call_id,
            config,
            created_at: now,
            last_activity_at: now,
            turns: Vec::new(),
            caller_partial: String::new(),
            agent_partial: String::new(),
            transcript_finalized: false,
            stream_sid: None,
            agent_link: None,
            quality: QualitySnapshot::default(),
            call_type,
            fallback_reason: None,
        }
    }

    /// Record activity so the staleness sweep leaves this session alone.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Append a streaming transcript fragment to a speaker's accumulator.
    pub fn append_partial(&mut self, speaker: Speaker, text: &str) {
        let partial = match speaker {
            Speaker::Caller => &mut self.caller_partial,
            Speaker::Agent => &mut self.agent_partial,
        };
        if !partial.is_empty() {
            partial.push(' ');
        }
        partial.push_str(text);
    }

    /// Move a speaker's accumulator into the turn buffer, if non-empty.
    pub fn flush_partial(&mut self, speaker: Speaker) {
        let partial = match speaker {
            Speaker::Caller => std::mem::take(&mut self.caller_partial),
            Speaker::Agent => std::mem::take(&mut self.agent_partial),
        };
        if !partial.is_empty() {
            self.turns.push(ConversationTurn {
                speaker,
                text: partial,
                timestamp: Utc::now(),
            });
        }
    }

    /// Flush any remaining partial utterances and seal the transcript.
    ///
    /// Returns `false` if the transcript was already finalized; the turn
    /// buffer is sealed exactly once per call.
    pub fn finalize_transcript(&mut self) -> bool {
        if self.transcript_finalized {
            return false;
        }
        self.flush_partial(Speaker::Caller);
        self.flush_partial(Speaker::Agent);
        self.transcript_finalized = true;
        true
    }

    /// Record a heartbeat round trip and refresh the quality label.
    pub fn record_rtt(&mut self, rtt_ms: u64) {
        self.quality.rtt_ms = Some(rtt_ms);
        self.quality.label = if rtt_ms < 150 {
            QualityLabel::Good
        } else if rtt_ms < 400 {
            QualityLabel::Degraded
        } else {
            QualityLabel::Poor
        };
    }

    pub fn record_reconnect(&mut self) {
        self.quality.reconnects += 1;
    }

    /// Time since the session last saw activity, in milliseconds.
    pub fn idle_ms(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.last_activity_at)
            .num_milliseconds()
    }
}

/// Session configuration used across the crate's unit tests.
#[cfg(test)]
pub(crate) fn test_config() -> SessionConfig {
    SessionConfig {
        agent_audio_format: AudioFormat::Ulaw8000,
        mode: ExecutionMode::AiPowered,
        heartbeat_interval: Duration::from_secs(5),
        heartbeat_miss_limit: 3,
        inactivity_timeout: Duration::from_secs(30),
        connect_timeout: Duration::from_secs(10),
        queue_max_depth: 100,
        queue_expiration: Duration::from_secs(5),
        retry: RetryPolicy::default(),
    }
}
