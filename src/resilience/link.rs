//! # Agent Socket Link
//!
//! The socket half of the resilience layer: one tokio task per call owning
//! the WebSocket to the AI voice agent. The task talks to the call's actor
//! exclusively through messages, keeping the bridge logic free of socket
//! plumbing.
//!
//! ## Channels:
//! - **Commands in** (`AgentLink`): serialized protocol messages to write,
//!   or a detached close
//! - **Events out** (`AgentSocketEvent` via actix `Recipient`): the link
//!   opened, an inbound frame arrived, or the socket went down
//!
//! ## Detached Close:
//! `AgentCommand::Close` shuts the socket down WITHOUT emitting a `Closed`
//! event. Teardown and fallback use this so that closing the socket never
//! re-enters the failure handling it is part of. Every other exit path
//! emits `Closed`, which the supervisor turns into a redial or a give-up.

use actix::prelude::*;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Commands accepted by a live agent link task.
#[derive(Debug)]
pub enum AgentCommand {
    /// Write a serialized protocol message to the socket.
    Send(String),
    /// Close the socket without emitting a `Closed` event.
    Close,
}

/// Handle to the current live agent socket.
///
/// Replaced wholesale on every reconnect, so holders never write into a
/// stale connection.
#[derive(Clone)]
pub struct AgentLink {
    tx: mpsc::UnboundedSender<AgentCommand>,
}

impl AgentLink {
    /// Create a handle plus the receiving end consumed by the link task.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message for the socket.
    ///
    /// Fails only when the link task has already exited; callers treat that
    /// as a dropped frame, not an error to propagate.
    pub fn send_text(&self, payload: String) -> Result<(), String> {
        self.tx
            .send(AgentCommand::Send(payload))
            .map_err(|_| "agent link is down".to_string())
    }

    /// Detached close (no `Closed` event will follow).
    pub fn close(&self) -> Result<(), String> {
        self.tx
            .send(AgentCommand::Close)
            .map_err(|_| "agent link is down".to_string())
    }
}

impl fmt::Debug for AgentLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentLink")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Socket lifecycle events delivered to the call's actor.
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub enum AgentSocketEvent {
    /// The dial succeeded; `link` is the new live handle.
    Opened { link: AgentLink },
    /// An inbound text frame (serialized agent protocol message).
    Frame(String),
    /// The socket went down unexpectedly, or the dial failed.
    Closed { error: Option<String> },
}

/// Dial the agent endpoint and run the link until it closes.
///
/// Spawned once per dial attempt; the redial schedule is owned by the
/// call's supervisor, not by this task.
pub fn spawn_agent_link(url: String, recipient: Recipient<AgentSocketEvent>) {
    tokio::spawn(run_agent_link(url, recipient));
}

async fn run_agent_link(url: String, recipient: Recipient<AgentSocketEvent>) {
    let ws = match connect_async(&url).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            debug!(error = %e, "Agent dial failed");
            recipient.do_send(AgentSocketEvent::Closed {
                error: Some(e.to_string()),
            });
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    let (link, mut commands) = AgentLink::channel();
    recipient.do_send(AgentSocketEvent::Opened { link });

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(AgentCommand::Send(payload)) => {
                    if sink.send(Message::Text(payload)).await.is_err() {
                        recipient.do_send(AgentSocketEvent::Closed {
                            error: Some("socket write failed".to_string()),
                        });
                        return;
                    }
                }
                Some(AgentCommand::Close) | None => {
                    // Detached close; see module docs.
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    recipient.do_send(AgentSocketEvent::Frame(text));
                }
                Some(Ok(Message::Close(_))) | None => {
                    recipient.do_send(AgentSocketEvent::Closed { error: None });
                    return;
                }
                Some(Err(e)) => {
                    recipient.do_send(AgentSocketEvent::Closed {
                        error: Some(e.to_string()),
                    });
                    return;
                }
                // Binary/ping/pong frames are not part of the agent protocol
                Some(Ok(_)) => {}
            },
        }
    }
}
