//! # Media Stream WebSocket Handler
//!
//! Hosts one live call. The telephony provider connects to `/call/stream`
//! after the incoming-call webhook told it to; each connection becomes one
//! `MediaStreamSocket` actor.
//!
//! ## Actor Model:
//! Each WebSocket connection is an independent actix actor, so all handlers
//! for one call run serialized: the bridge machine never sees concurrent
//! events. The agent socket lives in a separate tokio task
//! (`resilience::link`) and talks to the actor through messages only.
//!
//! ## Responsibilities:
//! - Parse provider frames and feed them to the bridge machine
//! - Execute the machine's actions against the real sockets
//! - Own every per-call timer (heartbeat, inactivity, startup watchdog,
//!   redial delay) and cancel them all on teardown
//! - Drive the supervisor, circuit breaker, and fallback controller

use crate::bridge::machine::{BridgeAction, BridgeEvent, BridgeMachine, CallOutcome};
use crate::bridge::protocol::{AgentMessage, StartInfo, TelephonyMessage};
use crate::resilience::fallback::FallbackReason;
use crate::resilience::link::{spawn_agent_link, AgentLink, AgentSocketEvent};
use crate::resilience::supervisor::{ConnectionSupervisor, LinkDirective};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use tracing::{debug, error, info, warn};

/// WebSocket actor bridging one telephony media stream to the AI agent.
pub struct MediaStreamSocket {
    state: web::Data<AppState>,

    /// Set once the provider's `start` event identifies the call.
    call_id: Option<String>,
    machine: Option<BridgeMachine>,
    supervisor: Option<ConnectionSupervisor>,

    /// Current live agent socket handle, replaced on every reconnect.
    link: Option<AgentLink>,
    agent_url: String,

    /// Recurring and one-shot timers; all cancelled at teardown.
    timers: Vec<SpawnHandle>,
    redial_handle: Option<SpawnHandle>,

    /// Suppresses socket events and timers once teardown has begun.
    tearing_down: bool,
}

impl MediaStreamSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        let agent_url = state.get_config().agent.ws_url;
        Self {
            state,
            call_id: None,
            machine: None,
            supervisor: None,
            link: None,
            agent_url,
            timers: Vec::new(),
            redial_handle: None,
            tearing_down: false,
        }
    }

    /// The provider's `start` event: resolve the session, build the bridge
    /// machine, arm the watchdogs, and dial the agent (breaker permitting).
    fn on_start(
        &mut self,
        stream_sid: String,
        start: Option<StartInfo>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        if self.machine.is_some() {
            warn!(stream_sid = %stream_sid, "Duplicate start event ignored");
            return;
        }

        let config = self.state.get_config();
        let start = start.unwrap_or_default();
        let call_id = start
            .call_sid
            .clone()
            .unwrap_or_else(|| stream_sid.clone());

        // An outbound call may have been registered under a provisional id
        // before the provider assigned the real call id; promote it now.
        if let Some(provisional) = start.custom_parameters.get("session_id") {
            if provisional != &call_id && self.state.registry.contains(provisional) {
                if let Err(e) = self.state.registry.promote(provisional, &call_id) {
                    warn!(provisional = %provisional, call_id = %call_id, "Session promotion failed: {}", e);
                }
            }
        }

        if !self.state.registry.contains(&call_id) {
            if let Err(e) = self
                .state
                .registry
                .create(&call_id, config.session_config())
            {
                error!(call_id = %call_id, "Cannot register call session: {}", e);
                ctx.close(None);
                ctx.stop();
                return;
            }
        }

        let session_config = config.session_config();
        let mut machine = BridgeMachine::new(
            call_id.clone(),
            config.agent.agent_id.clone(),
            session_config.clone(),
            self.state.registry.clone(),
            self.state.clock.clone(),
        );
        let start_actions = machine.handle(BridgeEvent::TelephonyStart {
            stream_sid: stream_sid.clone(),
        });

        self.call_id = Some(call_id.clone());
        self.machine = Some(machine);
        self.state.record_call_started();
        info!(call_id = %call_id, stream_sid = %stream_sid, "Call bridged to media stream");

        self.execute(start_actions, ctx);

        // Arm the per-call timers; every handle is cancelled on teardown.
        let heartbeat = ctx.run_interval(session_config.heartbeat_interval, |act, ctx| {
            act.dispatch(BridgeEvent::HeartbeatTick, ctx);
        });
        let inactivity_period = session_config.inactivity_timeout / 2;
        let inactivity = ctx.run_interval(inactivity_period, |act, ctx| {
            act.dispatch(BridgeEvent::InactivityTick, ctx);
        });
        let startup = ctx.run_later(session_config.connect_timeout, |act, ctx| {
            act.dispatch(BridgeEvent::StartupDeadline, ctx);
        });
        self.timers.extend([heartbeat, inactivity, startup]);

        // While the breaker is open, new calls skip the agent dial and go
        // straight to the human conference.
        if !self.state.breaker.allow_request() {
            warn!(call_id = %call_id, "Circuit breaker open; skipping agent connection");
            self.execute(
                vec![BridgeAction::EngageFallback(FallbackReason::CircuitOpen)],
                ctx,
            );
            return;
        }

        self.supervisor = Some(ConnectionSupervisor::new(
            session_config.retry.clone(),
            self.state.clock.clone(),
        ));
        spawn_agent_link(self.agent_url.clone(), ctx.address().recipient());
    }

    /// Feed one event through the machine and execute its actions.
    fn dispatch(&mut self, event: BridgeEvent, ctx: &mut ws::WebsocketContext<Self>) {
        if self.tearing_down {
            return;
        }
        if let Some(machine) = &mut self.machine {
            let actions = machine.handle(event);
            self.execute(actions, ctx);
        }
    }

    fn execute(&mut self, actions: Vec<BridgeAction>, ctx: &mut ws::WebsocketContext<Self>) {
        for action in actions {
            match action {
                BridgeAction::SendTelephony(json) => ctx.text(json),
                BridgeAction::SendAgent(json) => {
                    // A failed send means the link just died; the Closed
                    // event is already on its way, so the frame is dropped
                    // rather than retried.
                    match &self.link {
                        Some(link) => {
                            if link.send_text(json).is_err() {
                                debug!("Dropped agent frame; link is down");
                            }
                        }
                        None => debug!("Dropped agent frame; no live link"),
                    }
                }
                BridgeAction::ForceReconnect => self.force_reconnect(ctx),
                BridgeAction::EngageFallback(reason) => self.begin_fallback(reason, ctx),
                BridgeAction::EndCall(outcome) => self.finish_call(outcome, ctx),
                BridgeAction::RecordFailure(category) => {
                    self.state.breaker.record_failure(category)
                }
                BridgeAction::RecordSuccess => self.state.breaker.record_success(),
            }
        }
    }

    /// Tear the agent socket down deliberately and walk the same
    /// disruption path an unexpected close would take.
    fn force_reconnect(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(link) = self.link.take() {
            // Detached close: the old task emits no Closed event, so the
            // disruption below is counted exactly once.
            let _ = link.close();
        }
        self.clear_session_link();
        self.handle_disruption(ctx);
    }

    /// The agent socket is gone; ask the supervisor what to do next.
    fn handle_disruption(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        self.dispatch(BridgeEvent::AgentLinkDown, ctx);
        if self.tearing_down {
            return;
        }

        let directive = match &mut self.supervisor {
            Some(supervisor) => supervisor.on_disruption(),
            None => return,
        };

        match directive {
            LinkDirective::Redial { delay } => {
                self.state.record_reconnect_attempt();
                debug!(delay_ms = delay.as_millis() as u64, "Scheduling agent redial");
                let handle = ctx.run_later(delay, |act, ctx| {
                    act.redial_handle = None;
                    if !act.tearing_down {
                        spawn_agent_link(act.agent_url.clone(), ctx.address().recipient());
                    }
                });
                self.redial_handle = Some(handle);
            }
            LinkDirective::GiveUp => {
                self.dispatch(BridgeEvent::AgentLinkFailed, ctx);
            }
        }
    }

    fn begin_fallback(&mut self, reason: FallbackReason, ctx: &mut ws::WebsocketContext<Self>) {
        if self.tearing_down {
            return;
        }
        self.tearing_down = true;
        self.cancel_timers(ctx);

        if let Some(link) = self.link.take() {
            let _ = link.close();
        }

        let call_id = match &self.call_id {
            Some(id) => id.clone(),
            None => {
                ctx.stop();
                return;
            }
        };

        self.state.record_call_fallen_back();
        let controller = self.state.fallback.clone();

        let fut = async move { controller.engage(&call_id, reason).await };
        ctx.spawn(fut.into_actor(self).map(|outcome, _act, ctx| {
            debug!(outcome = ?outcome, "Fallback engagement finished");
            // The provider closes the stream itself once redirected; close
            // our side regardless so the actor never outlives the call.
            ctx.close(None);
            ctx.stop();
        }));
    }

    fn finish_call(&mut self, outcome: CallOutcome, ctx: &mut ws::WebsocketContext<Self>) {
        if self.tearing_down {
            return;
        }
        self.tearing_down = true;
        self.cancel_timers(ctx);

        if let Some(link) = self.link.take() {
            let _ = link.close();
        }

        if let Some(call_id) = &self.call_id {
            self.state.registry.remove(call_id);
            self.state.record_call_completed();
            info!(call_id = %call_id, outcome = outcome.as_str(), "Call ended");
        }

        ctx.close(None);
        ctx.stop();
    }

    fn cancel_timers(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        for handle in self.timers.drain(..) {
            ctx.cancel_future(handle);
        }
        if let Some(handle) = self.redial_handle.take() {
            ctx.cancel_future(handle);
        }
    }

    fn clear_session_link(&self) {
        if let Some(call_id) = &self.call_id {
            self.state
                .registry
                .update(call_id, |session| session.agent_link = None);
        }
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!("Media stream connection opened");
    }

    /// Covers abrupt provider disconnects that never sent a `stop` event:
    /// the session must not leak, and the agent task must not linger.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(link) = self.link.take() {
            let _ = link.close();
        }

        if !self.tearing_down {
            if let Some(call_id) = &self.call_id {
                // Sessions in fallback stay alive for the conference; the
                // staleness sweep reclaims them later.
                let in_fallback = self
                    .state
                    .registry
                    .get(call_id)
                    .map(|s| s.call_type == crate::call::session::CallType::Fallback)
                    .unwrap_or(true);
                if !in_fallback {
                    self.state
                        .registry
                        .update(call_id, |s| s.finalize_transcript());
                    self.state.registry.remove(call_id);
                    self.state.record_call_completed();
                    info!(call_id = %call_id, "Media socket closed; session cleaned up");
                }
            }
        }

        info!("Media stream connection closed");
    }
}

/// Inbound frames from the telephony provider.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<TelephonyMessage>(&text) {
                Ok(TelephonyMessage::Start { stream_sid, start }) => {
                    self.on_start(stream_sid, start, ctx);
                }
                Ok(TelephonyMessage::Media { media, .. }) => {
                    self.dispatch(
                        BridgeEvent::TelephonyMedia {
                            payload: media.payload,
                        },
                        ctx,
                    );
                }
                Ok(TelephonyMessage::Stop { .. }) => {
                    self.dispatch(BridgeEvent::TelephonyStop, ctx);
                }
                Err(e) => {
                    warn!("Unparseable media stream frame: {}", e);
                }
            },
            Ok(ws::Message::Binary(_)) => {
                warn!("Unexpected binary frame on media stream");
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!("Media stream closed by provider: {:?}", reason);
                self.dispatch(BridgeEvent::TelephonyStop, ctx);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Unexpected continuation frame on media stream");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!("Media stream protocol error: {}", e);
                ctx.stop();
            }
        }
    }
}

/// Events from the agent socket task.
impl Handler<AgentSocketEvent> for MediaStreamSocket {
    type Result = ();

    fn handle(&mut self, event: AgentSocketEvent, ctx: &mut Self::Context) {
        if self.tearing_down {
            // Late events from a link we already abandoned
            if let AgentSocketEvent::Opened { link } = event {
                let _ = link.close();
            }
            return;
        }

        match event {
            AgentSocketEvent::Opened { link } => {
                let resumed = match &mut self.supervisor {
                    Some(supervisor) => supervisor.on_open(),
                    None => false,
                };
                self.link = Some(link.clone());
                if let Some(call_id) = &self.call_id {
                    self.state
                        .registry
                        .update(call_id, |session| session.agent_link = Some(link));
                }
                self.dispatch(BridgeEvent::AgentLinkUp { resumed }, ctx);
            }
            AgentSocketEvent::Frame(text) => {
                if let Some(event) = parse_agent_frame(&text) {
                    self.dispatch(event, ctx);
                }
            }
            AgentSocketEvent::Closed { error } => {
                if let Some(e) = error {
                    debug!("Agent socket closed with error: {}", e);
                }
                self.link = None;
                self.clear_session_link();
                self.handle_disruption(ctx);
            }
        }
    }
}

/// Map an inbound agent protocol message to a bridge event.
fn parse_agent_frame(text: &str) -> Option<BridgeEvent> {
    let message = match serde_json::from_str::<AgentMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Unrecognized agent frame: {}", e);
            return None;
        }
    };

    match message {
        AgentMessage::ConversationInitiationMetadata {
            conversation_initiation_metadata_event,
        } => Some(BridgeEvent::AgentReady {
            output_format: conversation_initiation_metadata_event.agent_output_audio_format,
        }),
        AgentMessage::Audio { audio_event } => Some(BridgeEvent::AgentAudio {
            payload: audio_event.audio_base_64,
        }),
        AgentMessage::UserTranscript {
            user_transcription_event,
        } => Some(BridgeEvent::CallerTranscript {
            text: user_transcription_event.user_transcript,
        }),
        AgentMessage::AgentResponse {
            agent_response_event,
        } => Some(BridgeEvent::AgentTranscript {
            text: agent_response_event.agent_response,
        }),
        AgentMessage::Ping { ping_event } => Some(BridgeEvent::AgentPing {
            event_id: ping_event.event_id,
        }),
        AgentMessage::Pong { pong_event } => Some(BridgeEvent::AgentPong {
            event_id: pong_event.event_id,
        }),
        AgentMessage::ConversationEnd { .. } => Some(BridgeEvent::AgentConversationEnd),
        AgentMessage::Error { error_event } => Some(BridgeEvent::AgentError {
            message: error_event.message,
        }),
        // Outbound-only message types arriving inbound are protocol noise
        AgentMessage::ConversationInitiationClientData { .. }
        | AgentMessage::UserAudioChunk { .. } => {
            warn!("Unexpected outbound-only message from agent");
            None
        }
    }
}

/// WebSocket endpoint handler.
///
/// Upgrades the provider's HTTP request to a WebSocket and hands the
/// connection to a fresh `MediaStreamSocket` actor.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New media stream connection from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(MediaStreamSocket::new(state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent_frames() {
        let ready = r#"{"type":"conversation_initiation_metadata",
            "conversation_initiation_metadata_event":{"agent_output_audio_format":"ulaw_8000"}}"#;
        assert!(matches!(
            parse_agent_frame(ready),
            Some(BridgeEvent::AgentReady { output_format: Some(f) }) if f == "ulaw_8000"
        ));

        let audio = r#"{"type":"audio","audio_event":{"audio_base_64":"AAA="}}"#;
        assert!(matches!(
            parse_agent_frame(audio),
            Some(BridgeEvent::AgentAudio { .. })
        ));

        let end = r#"{"type":"conversation_end"}"#;
        assert!(matches!(
            parse_agent_frame(end),
            Some(BridgeEvent::AgentConversationEnd)
        ));

        assert!(parse_agent_frame("not json").is_none());

        // Outbound-only types are rejected
        let chunk = r#"{"type":"user_audio_chunk","user_audio_chunk":"AAA="}"#;
        assert!(parse_agent_frame(chunk).is_none());
    }
}
