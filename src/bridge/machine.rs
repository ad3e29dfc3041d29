//! # Bridge State Machine
//!
//! The per-call brain: a synchronous state machine with a single
//! `handle(event)` entry point that returns the I/O actions to perform.
//! The hosting actor feeds it parsed socket events and timer ticks and
//! executes the actions; tests feed it fake events and assert on the
//! actions. No sockets, no timers, no async in here.
//!
//! ## Phases:
//! `AwaitingAgent → Streaming → (Reconnecting ⇄ Streaming)* → Ended |
//! FallenBack`
//!
//! Terminal phases swallow every further event, which is what makes
//! fallback idempotent across repeated error events.

use crate::audio::queue::{AudioMessageQueue, MessagePriority};
use crate::audio::{transcode, AudioFormat};
use crate::call::registry::CallRegistry;
use crate::call::session::{SessionConfig, Speaker};
use crate::clock::Clock;
use crate::resilience::circuit::FailureCategory;
use crate::resilience::fallback::FallbackReason;
use crate::bridge::protocol::{
    AgentMessage, ConversationConfig, MediaPayload, PingEvent, TelephonyMessage,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where a call is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    /// Waiting for the agent to accept the session handshake.
    AwaitingAgent,
    /// Audio is flowing both ways.
    Streaming,
    /// The agent socket is down; frames are buffering while the
    /// supervisor redials.
    Reconnecting,
    /// The call finished (normally or not) without fallback.
    Ended,
    /// The call was handed to the conference fallback.
    FallenBack,
}

/// How a call ended (for logging and metrics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The agent completed the conversation.
    Completed,
    /// The provider closed the media stream (caller hangup or redirect).
    CallerHangup,
    /// No inbound telephony audio within the inactivity window.
    Abandoned,
    /// The agent never became ready within the connect timeout.
    StartupTimeout,
}

impl CallOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            CallOutcome::Completed => "completed",
            CallOutcome::CallerHangup => "caller_hangup",
            CallOutcome::Abandoned => "abandoned",
            CallOutcome::StartupTimeout => "startup_timeout",
        }
    }
}

/// Everything that can happen to a call, from either socket or a timer.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Telephony `start` event; the stream id tags all outbound audio.
    TelephonyStart { stream_sid: String },
    /// One base64 mu-law frame of caller audio.
    TelephonyMedia { payload: String },
    /// The provider closed the media stream.
    TelephonyStop,

    /// The agent socket opened (`resumed` after a reconnect).
    AgentLinkUp { resumed: bool },
    /// The agent socket went down unexpectedly.
    AgentLinkDown,
    /// The supervisor exhausted its reconnection budget.
    AgentLinkFailed,

    /// The agent acknowledged the session handshake.
    AgentReady { output_format: Option<String> },
    /// One frame of agent audio (base64, agent-side format).
    AgentAudio { payload: String },
    /// Streaming transcript of caller speech.
    CallerTranscript { text: String },
    /// Streaming transcript of the agent's reply.
    AgentTranscript { text: String },
    /// Agent-initiated heartbeat probe.
    AgentPing { event_id: u64 },
    /// Answer to one of our heartbeat probes.
    AgentPong { event_id: u64 },
    /// Unrecoverable agent-side failure.
    AgentError { message: String },
    /// The agent finished the conversation normally.
    AgentConversationEnd,

    /// Periodic heartbeat timer.
    HeartbeatTick,
    /// Periodic inactivity-watchdog timer.
    InactivityTick,
    /// One-shot startup watchdog.
    StartupDeadline,
}

/// What the hosting actor must do after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAction {
    /// Write a frame to the telephony socket.
    SendTelephony(String),
    /// Write a frame to the agent socket.
    SendAgent(String),
    /// Tear the agent socket down and go through the disruption path.
    ForceReconnect,
    /// Hand the call to the fallback controller.
    EngageFallback(FallbackReason),
    /// Finish the call without fallback.
    EndCall(CallOutcome),
    /// Report an outcome to the circuit breaker.
    RecordFailure(FailureCategory),
    RecordSuccess,
}

/// Per-call state machine composing the transcoder, queue, and session.
pub struct BridgeMachine {
    call_id: String,
    agent_id: String,
    config: SessionConfig,
    registry: CallRegistry,
    clock: Arc<dyn Clock>,

    phase: BridgePhase,
    stream_sid: Option<String>,
    queue: AudioMessageQueue,

    /// Heartbeat bookkeeping: sequence of the last probe, how many are
    /// unanswered, and when the newest one left.
    ping_seq: u64,
    outstanding_pings: u32,
    ping_sent_at: Option<Instant>,

    last_media_at: Instant,
}

impl BridgeMachine {
    pub fn new(
        call_id: String,
        agent_id: String,
        config: SessionConfig,
        registry: CallRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = AudioMessageQueue::new(
            config.queue_max_depth,
            config.queue_expiration,
            clock.clone(),
        );
        let last_media_at = clock.now();

        Self {
            call_id,
            agent_id,
            config,
            registry,
            clock,
            phase: BridgePhase::AwaitingAgent,
            stream_sid: None,
            queue,
            ping_seq: 0,
            outstanding_pings: 0,
            ping_sent_at: None,
            last_media_at,
        }
    }

    pub fn phase(&self) -> BridgePhase {
        self.phase
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Single entry point: apply one event, return the actions to perform.
    pub fn handle(&mut self, event: BridgeEvent) -> Vec<BridgeAction> {
        if matches!(self.phase, BridgePhase::Ended | BridgePhase::FallenBack) {
            return Vec::new();
        }

        match event {
            BridgeEvent::TelephonyStart { stream_sid } => self.on_telephony_start(stream_sid),
            BridgeEvent::TelephonyMedia { payload } => self.on_telephony_media(payload),
            BridgeEvent::TelephonyStop => self.end_call(CallOutcome::CallerHangup),

            BridgeEvent::AgentLinkUp { resumed } => self.on_agent_link_up(resumed),
            BridgeEvent::AgentLinkDown => self.on_agent_link_down(),
            BridgeEvent::AgentLinkFailed => {
                let mut actions = vec![BridgeAction::RecordFailure(FailureCategory::WebSocket)];
                actions.extend(self.engage_fallback(FallbackReason::ConnectionLost));
                actions
            }

            BridgeEvent::AgentReady { output_format } => self.on_agent_ready(output_format),
            BridgeEvent::AgentAudio { payload } => self.on_agent_audio(payload),
            BridgeEvent::CallerTranscript { text } => self.on_transcript(Speaker::Caller, text),
            BridgeEvent::AgentTranscript { text } => self.on_transcript(Speaker::Agent, text),
            BridgeEvent::AgentPing { event_id } => self.on_agent_ping(event_id),
            BridgeEvent::AgentPong { event_id } => self.on_agent_pong(event_id),
            BridgeEvent::AgentError { message } => {
                warn!(call_id = %self.call_id, error = %message, "Agent reported fatal error");
                let mut actions = vec![BridgeAction::RecordFailure(FailureCategory::AgentService)];
                actions.extend(self.engage_fallback(FallbackReason::AgentError(message)));
                actions
            }
            BridgeEvent::AgentConversationEnd => self.end_call(CallOutcome::Completed),

            BridgeEvent::HeartbeatTick => self.on_heartbeat_tick(),
            BridgeEvent::InactivityTick => self.on_inactivity_tick(),
            BridgeEvent::StartupDeadline => self.on_startup_deadline(),
        }
    }

    fn on_telephony_start(&mut self, stream_sid: String) -> Vec<BridgeAction> {
        debug!(call_id = %self.call_id, stream_sid = %stream_sid, "Media stream started");
        self.stream_sid = Some(stream_sid.clone());
        self.last_media_at = self.clock.now();
        self.registry.update(&self.call_id, |session| {
            session.stream_sid = Some(stream_sid);
            session.touch();
        });
        Vec::new()
    }

    fn on_telephony_media(&mut self, payload: String) -> Vec<BridgeAction> {
        self.last_media_at = self.clock.now();
        self.registry.update(&self.call_id, |session| session.touch());

        let mulaw = match BASE64.decode(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(call_id = %self.call_id, "Dropping undecodable media frame: {}", e);
                return Vec::new();
            }
        };

        let agent_payload = match self.config.agent_audio_format {
            AudioFormat::Ulaw8000 => payload,
            AudioFormat::Pcm16000 => {
                let samples = transcode::decode_mulaw_frame(&mulaw, true);
                BASE64.encode(transcode::samples_to_pcm_bytes(&samples))
            }
        };

        let message = AgentMessage::UserAudioChunk {
            user_audio_chunk: agent_payload,
        };
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(_) => return Vec::new(),
        };

        if self.phase == BridgePhase::Streaming {
            vec![BridgeAction::SendAgent(json)]
        } else {
            // Agent not ready or mid-reconnect: buffer, don't drop
            self.queue.enqueue(json, MessagePriority::Normal);
            Vec::new()
        }
    }

    fn on_agent_link_up(&mut self, resumed: bool) -> Vec<BridgeAction> {
        if resumed {
            info!(call_id = %self.call_id, "Agent socket re-established; replaying handshake");
        }

        // The handshake is (re-)sent on every connect so the agent rebuilds
        // conversational context; streaming resumes once it reports ready.
        let handshake = AgentMessage::ConversationInitiationClientData {
            conversation_config: ConversationConfig {
                agent_id: self.agent_id.clone(),
                input_audio_format: self.config.agent_audio_format.as_str().to_string(),
                output_audio_format: self.config.agent_audio_format.as_str().to_string(),
            },
        };

        match serde_json::to_string(&handshake) {
            Ok(json) => vec![BridgeAction::SendAgent(json)],
            Err(_) => Vec::new(),
        }
    }

    fn on_agent_link_down(&mut self) -> Vec<BridgeAction> {
        if self.phase == BridgePhase::Streaming || self.phase == BridgePhase::AwaitingAgent {
            if self.phase == BridgePhase::Streaming {
                self.phase = BridgePhase::Reconnecting;
            }
            self.outstanding_pings = 0;
            self.registry
                .update(&self.call_id, |session| session.record_reconnect());
        }
        Vec::new()
    }

    fn on_agent_ready(&mut self, output_format: Option<String>) -> Vec<BridgeAction> {
        if let Some(actual) = output_format {
            let expected = self.config.agent_audio_format.as_str();
            if actual != expected {
                warn!(
                    call_id = %self.call_id,
                    expected,
                    actual = %actual,
                    "Agent audio format mismatch"
                );
                let mut actions =
                    vec![BridgeAction::RecordFailure(FailureCategory::AgentService)];
                actions.extend(self.engage_fallback(FallbackReason::AudioFormatMismatch {
                    expected: expected.to_string(),
                    actual,
                }));
                return actions;
            }
        }

        let was_reconnect = self.phase == BridgePhase::Reconnecting;
        self.phase = BridgePhase::Streaming;
        self.outstanding_pings = 0;

        // Buffered frames flush strictly before any newly arriving frame:
        // this runs to completion before the next event is handled.
        let mut actions = vec![BridgeAction::RecordSuccess];
        let report = self.queue.flush(|payload| {
            actions.push(BridgeAction::SendAgent(payload.to_string()));
            true
        });

        info!(
            call_id = %self.call_id,
            resumed = was_reconnect,
            flushed = report.sent,
            expired = self.queue.dropped_total(),
            "Agent ready; streaming"
        );

        actions
    }

    fn on_agent_audio(&mut self, payload: String) -> Vec<BridgeAction> {
        let stream_sid = match &self.stream_sid {
            Some(sid) => sid.clone(),
            // No media stream yet; nowhere to play this
            None => return Vec::new(),
        };

        let telephony_payload = match self.config.agent_audio_format {
            AudioFormat::Ulaw8000 => payload,
            AudioFormat::Pcm16000 => {
                let bytes = match BASE64.decode(&payload) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!(call_id = %self.call_id, "Dropping undecodable agent audio: {}", e);
                        return Vec::new();
                    }
                };
                let samples = match transcode::pcm_bytes_to_samples(&bytes) {
                    Ok(samples) => samples,
                    Err(e) => {
                        debug!(call_id = %self.call_id, "Dropping malformed agent audio: {}", e);
                        return Vec::new();
                    }
                };
                BASE64.encode(transcode::encode_mulaw_frame(&samples, true))
            }
        };

        let message = TelephonyMessage::Media {
            stream_sid: Some(stream_sid),
            media: MediaPayload {
                payload: telephony_payload,
            },
        };

        match serde_json::to_string(&message) {
            Ok(json) => vec![BridgeAction::SendTelephony(json)],
            Err(_) => Vec::new(),
        }
    }

    /// A transcript fragment from one speaker closes the other speaker's
    /// open turn, which is the boundary between utterances.
    fn on_transcript(&mut self, speaker: Speaker, text: String) -> Vec<BridgeAction> {
        self.registry.update(&self.call_id, |session| {
            match speaker {
                Speaker::Caller => session.flush_partial(Speaker::Agent),
                Speaker::Agent => session.flush_partial(Speaker::Caller),
            }
            session.append_partial(speaker, &text);
            session.touch();
        });
        Vec::new()
    }

    fn on_agent_ping(&mut self, event_id: u64) -> Vec<BridgeAction> {
        let pong = AgentMessage::Pong {
            pong_event: PingEvent { event_id },
        };
        match serde_json::to_string(&pong) {
            Ok(json) => vec![BridgeAction::SendAgent(json)],
            Err(_) => Vec::new(),
        }
    }

    fn on_agent_pong(&mut self, event_id: u64) -> Vec<BridgeAction> {
        if event_id == self.ping_seq {
            if let Some(sent_at) = self.ping_sent_at.take() {
                let rtt_ms = self.clock.now().saturating_duration_since(sent_at).as_millis() as u64;
                self.registry
                    .update(&self.call_id, |session| session.record_rtt(rtt_ms));
            }
            self.outstanding_pings = 0;
        }
        Vec::new()
    }

    fn on_heartbeat_tick(&mut self) -> Vec<BridgeAction> {
        if self.phase != BridgePhase::Streaming {
            return Vec::new();
        }

        if self.outstanding_pings >= self.config.heartbeat_miss_limit {
            warn!(
                call_id = %self.call_id,
                missed = self.outstanding_pings,
                "Heartbeat pongs missed; forcing reconnect"
            );
            self.outstanding_pings = 0;
            return vec![BridgeAction::ForceReconnect];
        }

        self.ping_seq += 1;
        self.outstanding_pings += 1;
        self.ping_sent_at = Some(self.clock.now());

        let ping = AgentMessage::Ping {
            ping_event: PingEvent {
                event_id: self.ping_seq,
            },
        };
        match serde_json::to_string(&ping) {
            Ok(json) => vec![BridgeAction::SendAgent(json)],
            Err(_) => Vec::new(),
        }
    }

    fn on_inactivity_tick(&mut self) -> Vec<BridgeAction> {
        let idle = self
            .clock
            .now()
            .saturating_duration_since(self.last_media_at);
        if idle > self.config.inactivity_timeout {
            info!(
                call_id = %self.call_id,
                idle_ms = idle.as_millis() as u64,
                "No telephony audio; ending call as abandoned"
            );
            return self.end_call(CallOutcome::Abandoned);
        }
        Vec::new()
    }

    fn on_startup_deadline(&mut self) -> Vec<BridgeAction> {
        if self.phase != BridgePhase::AwaitingAgent {
            return Vec::new();
        }
        warn!(call_id = %self.call_id, "Agent not ready within connect timeout");
        let mut actions = vec![BridgeAction::RecordFailure(FailureCategory::Timeout)];
        actions.extend(self.end_call(CallOutcome::StartupTimeout));
        actions
    }

    /// Finish the call without fallback: seal the transcript, drop any
    /// buffered audio, and tell the actor to tear down.
    fn end_call(&mut self, outcome: CallOutcome) -> Vec<BridgeAction> {
        self.phase = BridgePhase::Ended;
        self.queue.clear();
        self.finalize_transcript();
        vec![BridgeAction::EndCall(outcome)]
    }

    /// Hand the call to the fallback controller exactly once.
    fn engage_fallback(&mut self, reason: FallbackReason) -> Vec<BridgeAction> {
        self.phase = BridgePhase::FallenBack;
        self.queue.clear();
        self.finalize_transcript();
        vec![BridgeAction::EngageFallback(reason)]
    }

    fn finalize_transcript(&mut self) {
        let turns = self.registry.update(&self.call_id, |session| {
            session.finalize_transcript();
            session.turns.len()
        });
        if let Some(turns) = turns {
            info!(call_id = %self.call_id, turns, "Transcript finalized");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::session::{test_config, CallType};
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn machine_with(
        config: SessionConfig,
    ) -> (BridgeMachine, CallRegistry, Arc<ManualClock>) {
        let registry = CallRegistry::new(10);
        registry.create("CA1", config.clone()).unwrap();
        let clock = Arc::new(ManualClock::new());
        let machine = BridgeMachine::new(
            "CA1".to_string(),
            "agent-1".to_string(),
            config,
            registry.clone(),
            clock.clone() as Arc<dyn Clock>,
        );
        (machine, registry, clock)
    }

    fn machine() -> (BridgeMachine, CallRegistry, Arc<ManualClock>) {
        machine_with(test_config())
    }

    fn media(payload: &[u8]) -> BridgeEvent {
        BridgeEvent::TelephonyMedia {
            payload: BASE64.encode(payload),
        }
    }

    fn agent_chunks(actions: &[BridgeAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|action| match action {
                BridgeAction::SendAgent(json) => {
                    match serde_json::from_str::<AgentMessage>(json) {
                        Ok(AgentMessage::UserAudioChunk { user_audio_chunk }) => {
                            Some(user_audio_chunk)
                        }
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect()
    }

    /// Frames arriving before the agent is ready buffer in the queue and
    /// flush in original arrival order, with zero loss, once the agent
    /// reports ready.
    #[test]
    fn test_media_buffers_then_flushes_in_order() {
        let (mut machine, _registry, _clock) = machine();

        machine.handle(BridgeEvent::TelephonyStart {
            stream_sid: "MZ1".to_string(),
        });

        let frames: Vec<Vec<u8>> = (0u8..3).map(|i| vec![0xF0 + i, 0x80]).collect();
        for frame in &frames {
            let actions = machine.handle(media(frame));
            assert!(actions.is_empty(), "pre-ready media must only buffer");
        }
        assert_eq!(machine.queue_depth(), 3);

        machine.handle(BridgeEvent::AgentLinkUp { resumed: false });
        let actions = machine.handle(BridgeEvent::AgentReady {
            output_format: Some("ulaw_8000".to_string()),
        });

        assert!(actions.contains(&BridgeAction::RecordSuccess));
        let flushed = agent_chunks(&actions);
        let expected: Vec<String> = frames.iter().map(|f| BASE64.encode(f)).collect();
        assert_eq!(flushed, expected);
        assert_eq!(machine.queue_depth(), 0);
        assert_eq!(machine.phase(), BridgePhase::Streaming);
    }

    #[test]
    fn test_streaming_media_forwards_immediately() {
        let (mut machine, _registry, _clock) = machine();
        machine.handle(BridgeEvent::AgentLinkUp { resumed: false });
        machine.handle(BridgeEvent::AgentReady { output_format: None });

        let actions = machine.handle(media(&[0xFF, 0x7F]));
        assert_eq!(agent_chunks(&actions).len(), 1);
        assert_eq!(machine.queue_depth(), 0);
    }

    /// With a PCM agent leg, each mu-law byte becomes two upsampled 16-bit
    /// samples on the way in, and agent PCM is decimated back to mu-law on
    /// the way out.
    #[test]
    fn test_transcoding_between_legs() {
        let config = SessionConfig {
            agent_audio_format: AudioFormat::Pcm16000,
            ..test_config()
        };
        let (mut machine, _registry, _clock) = machine_with(config);

        machine.handle(BridgeEvent::TelephonyStart {
            stream_sid: "MZ1".to_string(),
        });
        machine.handle(BridgeEvent::AgentLinkUp { resumed: false });
        machine.handle(BridgeEvent::AgentReady { output_format: None });

        // Inbound: 2 mu-law bytes -> 4 samples -> 8 PCM bytes
        let actions = machine.handle(media(&[0xFF, 0x00]));
        let chunk = &agent_chunks(&actions)[0];
        assert_eq!(BASE64.decode(chunk).unwrap().len(), 8);

        // Outbound: 4 PCM samples -> decimated to 2 mu-law bytes
        let samples = transcode::samples_to_pcm_bytes(&[100, 100, -100, -100]);
        let actions = machine.handle(BridgeEvent::AgentAudio {
            payload: BASE64.encode(&samples),
        });
        match &actions[0] {
            BridgeAction::SendTelephony(json) => {
                match serde_json::from_str::<TelephonyMessage>(json).unwrap() {
                    TelephonyMessage::Media { stream_sid, media } => {
                        assert_eq!(stream_sid.as_deref(), Some("MZ1"));
                        assert_eq!(BASE64.decode(&media.payload).unwrap().len(), 2);
                    }
                    _ => panic!("Wrong telephony message"),
                }
            }
            other => panic!("Expected SendTelephony, got {:?}", other),
        }
    }

    /// An agent error event engages fallback and records a breaker
    /// failure, exactly once, no matter how many errors follow.
    #[test]
    fn test_agent_error_falls_back_once() {
        let (mut machine, _registry, _clock) = machine();
        machine.handle(BridgeEvent::AgentLinkUp { resumed: false });
        machine.handle(BridgeEvent::AgentReady { output_format: None });

        let actions = machine.handle(BridgeEvent::AgentError {
            message: "agent exploded".to_string(),
        });
        assert!(actions
            .contains(&BridgeAction::RecordFailure(FailureCategory::AgentService)));
        assert!(matches!(
            actions.iter().find(|a| matches!(a, BridgeAction::EngageFallback(_))),
            Some(BridgeAction::EngageFallback(FallbackReason::AgentError(_)))
        ));
        assert_eq!(machine.phase(), BridgePhase::FallenBack);

        let again = machine.handle(BridgeEvent::AgentError {
            message: "still exploding".to_string(),
        });
        assert!(again.is_empty());
    }

    #[test]
    fn test_audio_format_mismatch_falls_back() {
        let (mut machine, _registry, _clock) = machine();
        machine.handle(BridgeEvent::AgentLinkUp { resumed: false });

        let actions = machine.handle(BridgeEvent::AgentReady {
            output_format: Some("pcm_16000".to_string()),
        });
        assert!(matches!(
            actions.iter().find(|a| matches!(a, BridgeAction::EngageFallback(_))),
            Some(BridgeAction::EngageFallback(
                FallbackReason::AudioFormatMismatch { .. }
            ))
        ));
        assert_eq!(machine.phase(), BridgePhase::FallenBack);
    }

    /// Three unanswered pings force a reconnect on the next tick; a pong
    /// resets the miss counter and records the round trip.
    #[test]
    fn test_heartbeat_miss_limit() {
        let (mut machine, registry, clock) = machine();
        machine.handle(BridgeEvent::AgentLinkUp { resumed: false });
        machine.handle(BridgeEvent::AgentReady { output_format: None });

        for _ in 0..3 {
            let actions = machine.handle(BridgeEvent::HeartbeatTick);
            assert!(matches!(actions[0], BridgeAction::SendAgent(_)));
        }
        let actions = machine.handle(BridgeEvent::HeartbeatTick);
        assert_eq!(actions, vec![BridgeAction::ForceReconnect]);

        // Recover, then answer the next ping
        machine.handle(BridgeEvent::AgentLinkDown);
        machine.handle(BridgeEvent::AgentLinkUp { resumed: true });
        machine.handle(BridgeEvent::AgentReady { output_format: None });
        machine.handle(BridgeEvent::HeartbeatTick);
        clock.advance(Duration::from_millis(120));
        machine.handle(BridgeEvent::AgentPong { event_id: 4 });

        let session = registry.get("CA1").unwrap();
        assert_eq!(session.quality.rtt_ms, Some(120));
        assert_eq!(session.quality.reconnects, 1);

        // Counter was reset: the next tick pings again instead of forcing
        let actions = machine.handle(BridgeEvent::HeartbeatTick);
        assert!(matches!(actions[0], BridgeAction::SendAgent(_)));
    }

    #[test]
    fn test_agent_ping_answered_with_pong() {
        let (mut machine, _registry, _clock) = machine();
        let actions = machine.handle(BridgeEvent::AgentPing { event_id: 42 });
        match &actions[0] {
            BridgeAction::SendAgent(json) => {
                match serde_json::from_str::<AgentMessage>(json).unwrap() {
                    AgentMessage::Pong { pong_event } => assert_eq!(pong_event.event_id, 42),
                    _ => panic!("Expected pong"),
                }
            }
            other => panic!("Expected SendAgent, got {:?}", other),
        }
    }

    /// The startup watchdog only fires while still awaiting the agent.
    #[test]
    fn test_startup_deadline() {
        {
            let (mut machine, _registry, _clock) = machine();
            let actions = machine.handle(BridgeEvent::StartupDeadline);
            assert!(actions.contains(&BridgeAction::RecordFailure(FailureCategory::Timeout)));
            assert!(actions.contains(&BridgeAction::EndCall(CallOutcome::StartupTimeout)));
            assert_eq!(machine.phase(), BridgePhase::Ended);
        }

        let (mut machine, _registry, _clock) = machine();
        machine.handle(BridgeEvent::AgentLinkUp { resumed: false });
        machine.handle(BridgeEvent::AgentReady { output_format: None });
        assert!(machine.handle(BridgeEvent::StartupDeadline).is_empty());
    }

    #[test]
    fn test_inactivity_watchdog() {
        let (mut machine, _registry, clock) = machine();
        machine.handle(BridgeEvent::AgentLinkUp { resumed: false });
        machine.handle(BridgeEvent::AgentReady { output_format: None });

        assert!(machine.handle(BridgeEvent::InactivityTick).is_empty());

        clock.advance(Duration::from_secs(31));
        let actions = machine.handle(BridgeEvent::InactivityTick);
        assert_eq!(actions, vec![BridgeAction::EndCall(CallOutcome::Abandoned)]);
    }

    /// Transcript fragments accumulate per speaker and flush on speaker
    /// change; end-of-conversation seals the buffer in order.
    #[test]
    fn test_transcript_turn_assembly() {
        let (mut machine, registry, _clock) = machine();
        machine.handle(BridgeEvent::AgentLinkUp { resumed: false });
        machine.handle(BridgeEvent::AgentReady { output_format: None });

        machine.handle(BridgeEvent::CallerTranscript {
            text: "I need help".to_string(),
        });
        machine.handle(BridgeEvent::CallerTranscript {
            text: "with my order".to_string(),
        });
        machine.handle(BridgeEvent::AgentTranscript {
            text: "Happy to help".to_string(),
        });
        machine.handle(BridgeEvent::CallerTranscript {
            text: "thanks".to_string(),
        });
        let actions = machine.handle(BridgeEvent::AgentConversationEnd);
        assert_eq!(actions, vec![BridgeAction::EndCall(CallOutcome::Completed)]);

        let session = registry.get("CA1").unwrap();
        assert!(session.transcript_finalized);
        let turns: Vec<(Speaker, &str)> = session
            .turns
            .iter()
            .map(|t| (t.speaker, t.text.as_str()))
            .collect();
        assert_eq!(
            turns,
            vec![
                (Speaker::Caller, "I need help with my order"),
                (Speaker::Agent, "Happy to help"),
                (Speaker::Caller, "thanks"),
            ]
        );
    }

    /// A disruption mid-stream buffers new frames; the replayed handshake
    /// and ready event flush them and resume streaming.
    #[test]
    fn test_reconnect_cycle_preserves_frames() {
        let (mut machine, _registry, _clock) = machine();
        machine.handle(BridgeEvent::TelephonyStart {
            stream_sid: "MZ1".to_string(),
        });
        machine.handle(BridgeEvent::AgentLinkUp { resumed: false });
        machine.handle(BridgeEvent::AgentReady { output_format: None });

        machine.handle(BridgeEvent::AgentLinkDown);
        assert_eq!(machine.phase(), BridgePhase::Reconnecting);

        let actions = machine.handle(media(&[0xAA]));
        assert!(actions.is_empty());
        assert_eq!(machine.queue_depth(), 1);

        let actions = machine.handle(BridgeEvent::AgentLinkUp { resumed: true });
        assert!(matches!(actions[0], BridgeAction::SendAgent(_)), "handshake replay");

        let actions = machine.handle(BridgeEvent::AgentReady { output_format: None });
        assert_eq!(agent_chunks(&actions), vec![BASE64.encode([0xAA])]);
        assert_eq!(machine.phase(), BridgePhase::Streaming);
    }

    #[test]
    fn test_stop_finalizes_and_ends() {
        let (mut machine, registry, _clock) = machine();
        machine.handle(BridgeEvent::CallerTranscript {
            text: "hello?".to_string(),
        });

        let actions = machine.handle(BridgeEvent::TelephonyStop);
        assert_eq!(actions, vec![BridgeAction::EndCall(CallOutcome::CallerHangup)]);

        let session = registry.get("CA1").unwrap();
        assert!(session.transcript_finalized);
        assert_eq!(session.turns.len(), 1);
        assert_eq!(session.call_type, CallType::AiPowered);

        // Everything after the end is swallowed
        assert!(machine.handle(BridgeEvent::HeartbeatTick).is_empty());
        assert!(machine.handle(media(&[0x01])).is_empty());
    }
}
