//! # Fallback Controller
//!
//! The last line of the "never silently drop a live call" policy: when the
//! AI path is unrecoverable, the live call is redirected out of the media
//! stream and into a plain multi-party conference that a human operator can
//! join.
//!
//! ## Teardown Order:
//! The agent socket is detached and closed FIRST (a detached close emits no
//! events, so teardown cannot re-trigger the failure handling that invoked
//! it), then the call-control redirect is issued. A failed redirect is
//! logged as an operational alert and not retried: the call may already be
//! lost, and a second redirect cannot help.

use crate::call::registry::CallRegistry;
use crate::call::session::CallType;
use crate::error::AppResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why a call left the AI path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// The agent sent an explicit error event.
    AgentError(String),
    /// The reconnection budget was exhausted.
    ConnectionLost,
    /// The agent's audio format does not match the configured format.
    AudioFormatMismatch { expected: String, actual: String },
    /// The circuit breaker was open; the AI path was never attempted.
    CircuitOpen,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::AgentError(msg) => write!(f, "agent error: {}", msg),
            FallbackReason::ConnectionLost => write!(f, "agent connection lost"),
            FallbackReason::AudioFormatMismatch { expected, actual } => {
                write!(f, "audio format mismatch: expected {}, got {}", expected, actual)
            }
            FallbackReason::CircuitOpen => write!(f, "circuit breaker open"),
        }
    }
}

/// Narrow call-control seam used by the fallback path.
///
/// `TelephonyClient` implements this against the real provider; tests
/// inject a fake to observe redirect commands.
#[async_trait]
pub trait CallControl: Send + Sync {
    async fn redirect_to_conference(&self, call_id: &str, room: &str) -> AppResult<()>;
}

/// What a fallback attempt accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// The call was redirected into a conference.
    Engaged,
    /// Another event already engaged fallback for this call; nothing done.
    AlreadyEngaged,
    /// No session exists for the call id; nothing to redirect.
    SessionMissing,
    /// The session was claimed but the redirect command failed.
    RedirectFailed,
}

/// Redirects failing calls into a human-staffed conference.
pub struct FallbackController {
    control: Arc<dyn CallControl>,
    registry: CallRegistry,
}

impl FallbackController {
    pub fn new(control: Arc<dyn CallControl>, registry: CallRegistry) -> Self {
        Self { control, registry }
    }

    /// Move a call from the AI stream to a conference bridge.
    ///
    /// Idempotent per call: the session's call-type tag is the claim, taken
    /// under the registry lock, so repeated error events issue exactly one
    /// redirect command.
    pub async fn engage(&self, call_id: &str, reason: FallbackReason) -> FallbackOutcome {
        let claimed = self.registry.update(call_id, |session| {
            if session.call_type == CallType::Fallback {
                false
            } else {
                session.call_type = CallType::Fallback;
                session.fallback_reason = Some(reason.to_string());
                true
            }
        });

        let claimed = match claimed {
            Some(claimed) => claimed,
            None => {
                warn!(call_id, "Fallback requested for unknown call session");
                return FallbackOutcome::SessionMissing;
            }
        };

        if !claimed {
            debug!(call_id, "Fallback already engaged; ignoring repeat trigger");
            return FallbackOutcome::AlreadyEngaged;
        }

        // Detach and close the agent socket before touching call control,
        // so the close cannot re-enter failure handling mid-teardown.
        if let Some(link) = self.registry.update(call_id, |s| s.agent_link.take()).flatten() {
            if let Err(e) = link.close() {
                debug!(call_id, "Agent link already down during fallback: {}", e);
            }
        }

        let room = format!("takeover-{}", call_id);
        info!(call_id, room = %room, reason = %reason, "Redirecting call to conference fallback");

        match self.control.redirect_to_conference(call_id, &room).await {
            Ok(()) => FallbackOutcome::Engaged,
            Err(e) => {
                // Operational alert: the call may already be lost and a
                // retry cannot recover it. Operators watch for this line.
                error!(
                    call_id,
                    room = %room,
                    error = %e,
                    "Conference redirect failed; call requires operator attention"
                );
                FallbackOutcome::RedirectFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::session::test_config;
    use crate::error::AppError;
    use std::sync::Mutex;

    struct FakeControl {
        redirects: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl FakeControl {
        fn new(fail: bool) -> Self {
            Self {
                redirects: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl CallControl for FakeControl {
        async fn redirect_to_conference(&self, call_id: &str, room: &str) -> AppResult<()> {
            self.redirects
                .lock()
                .unwrap()
                .push((call_id.to_string(), room.to_string()));
            if self.fail {
                Err(AppError::Service("redirect rejected".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Repeated failure events on the same session issue the redirect
    /// exactly once; the call type flips to fallback with the reason.
    #[tokio::test]
    async fn test_engage_exactly_once() {
        let registry = CallRegistry::new(10);
        registry.create("CA1", test_config()).unwrap();

        let control = Arc::new(FakeControl::new(false));
        let controller = FallbackController::new(control.clone(), registry.clone());

        let first = controller
            .engage("CA1", FallbackReason::AgentError("boom".to_string()))
            .await;
        let second = controller.engage("CA1", FallbackReason::ConnectionLost).await;

        assert_eq!(first, FallbackOutcome::Engaged);
        assert_eq!(second, FallbackOutcome::AlreadyEngaged);
        assert_eq!(control.redirects.lock().unwrap().len(), 1);

        let session = registry.get("CA1").unwrap();
        assert_eq!(session.call_type, CallType::Fallback);
        assert_eq!(
            session.fallback_reason.as_deref(),
            Some("agent error: boom")
        );
    }

    /// The agent link is closed before the redirect command is issued.
    #[tokio::test]
    async fn test_engage_closes_agent_link_first() {
        let registry = CallRegistry::new(10);
        registry.create("CA1", test_config()).unwrap();

        let (link, mut rx) = crate::resilience::link::AgentLink::channel();
        registry.update("CA1", |s| s.agent_link = Some(link));

        let controller =
            FallbackController::new(Arc::new(FakeControl::new(false)), registry.clone());
        controller.engage("CA1", FallbackReason::ConnectionLost).await;

        assert!(matches!(
            rx.try_recv().unwrap(),
            crate::resilience::link::AgentCommand::Close
        ));
        assert!(registry.get("CA1").unwrap().agent_link.is_none());
    }

    /// A failed redirect is reported but not retried.
    #[tokio::test]
    async fn test_redirect_failure_not_retried() {
        let registry = CallRegistry::new(10);
        registry.create("CA1", test_config()).unwrap();

        let control = Arc::new(FakeControl::new(true));
        let controller = FallbackController::new(control.clone(), registry.clone());

        let outcome = controller.engage("CA1", FallbackReason::ConnectionLost).await;
        assert_eq!(outcome, FallbackOutcome::RedirectFailed);
        assert_eq!(control.redirects.lock().unwrap().len(), 1);

        // The session stays claimed; a later trigger does not redial
        let again = controller.engage("CA1", FallbackReason::ConnectionLost).await;
        assert_eq!(again, FallbackOutcome::AlreadyEngaged);
        assert_eq!(control.redirects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let registry = CallRegistry::new(10);
        let controller = FallbackController::new(Arc::new(FakeControl::new(false)), registry);
        let outcome = controller
            .engage("nope", FallbackReason::CircuitOpen)
            .await;
        assert_eq!(outcome, FallbackOutcome::SessionMissing);
    }
}
