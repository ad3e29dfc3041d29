//! # Circuit Breaker
//!
//! Process-wide failure aggregator shared by every call. Once AI-side
//! failures cross a threshold the breaker opens and new calls skip the
//! agent connection attempt entirely, going straight to fallback. One
//! failing provider must not trigger a reconnection storm across all
//! concurrent calls.
//!
//! ## State Machine:
//! `Closed → Open → HalfOpen → Closed`, never skipping states. After the
//! cooldown passes, the next state observation reports `HalfOpen`, which
//! admits exactly one trial call; that trial's success fully resets the
//! breaker, its failure reopens it.
//!
//! Constructed once at startup and injected through `AppState`; there is
//! no ambient singleton.

use crate::clock::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What kind of dependency failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// Agent socket connect/transport failures
    WebSocket,
    /// AI service reported an error or misbehaved
    AgentService,
    /// Telephony control-API failures
    Telephony,
    /// Startup or recovery deadlines exceeded
    Timeout,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::WebSocket => "websocket",
            FailureCategory::AgentService => "agent_service",
            FailureCategory::Telephony => "telephony",
            FailureCategory::Timeout => "timeout",
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Snapshot exposed on the metrics endpoint.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub total_failures: u32,
    pub failures_by_category: HashMap<&'static str, u32>,
}

struct BreakerInner {
    state: BreakerState,
    failure_counts: HashMap<FailureCategory, u32>,
    total_failures: u32,
    last_failure_at: Option<Instant>,
    /// While `Open`, the instant after which a trial is allowed.
    next_attempt_at: Option<Instant>,
    /// `HalfOpen` admits exactly one probe; consumed by `allow_request`.
    probe_available: bool,
}

/// Process-wide circuit breaker over AI-side failures.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_counts: HashMap::new(),
                total_failures: 0,
                last_failure_at: None,
                next_attempt_at: None,
                probe_available: false,
            }),
            threshold,
            cooldown,
            clock,
        }
    }

    /// Record a failed AI-path outcome for one call.
    pub fn record_failure(&self, category: FailureCategory) {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        Self::refresh(&mut inner, now);

        *inner.failure_counts.entry(category).or_insert(0) += 1;
        inner.total_failures += 1;
        inner.last_failure_at = Some(now);

        match inner.state {
            BreakerState::Closed => {
                if inner.total_failures >= self.threshold {
                    inner.state = BreakerState::Open;
                    inner.next_attempt_at = Some(now + self.cooldown);
                    warn!(
                        category = category.as_str(),
                        failures = inner.total_failures,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "Circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                // The trial call failed; back to open for another cooldown.
                inner.state = BreakerState::Open;
                inner.next_attempt_at = Some(now + self.cooldown);
                inner.probe_available = false;
                warn!(
                    category = category.as_str(),
                    "Circuit breaker reopened after failed trial"
                );
            }
            BreakerState::Open => {}
        }
    }

    /// Record a successful AI-path outcome for one call.
    ///
    /// From `HalfOpen` this closes the breaker and resets every count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::refresh(&mut inner, self.clock.now());

        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.failure_counts.clear();
            inner.total_failures = 0;
            inner.next_attempt_at = None;
            inner.probe_available = false;
            info!("Circuit breaker closed after successful trial");
        }
    }

    /// Current state, promoting `Open` to `HalfOpen` once the cooldown has
    /// elapsed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        Self::refresh(&mut inner, self.clock.now());
        inner.state
    }

    /// Whether a new call may attempt the AI connection.
    ///
    /// `Closed` always admits; `HalfOpen` admits exactly one trial call
    /// (the probe is consumed here); `Open` admits none: callers go
    /// straight to fallback.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        Self::refresh(&mut inner, self.clock.now());

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.probe_available {
                    inner.probe_available = false;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock().unwrap();
        Self::refresh(&mut inner, self.clock.now());

        BreakerSnapshot {
            state: inner.state,
            total_failures: inner.total_failures,
            failures_by_category: inner
                .failure_counts
                .iter()
                .map(|(category, count)| (category.as_str(), *count))
                .collect(),
        }
    }

    /// Promote `Open` to `HalfOpen` once the cooldown deadline has passed.
    fn refresh(inner: &mut BreakerInner, now: Instant) {
        if inner.state == BreakerState::Open {
            if let Some(deadline) = inner.next_attempt_at {
                if now >= deadline {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_available = true;
                    info!("Circuit breaker half-open; admitting one trial call");
                }
            }
        }
    }
}
