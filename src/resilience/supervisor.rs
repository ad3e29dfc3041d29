//! # Connection Supervisor
//!
//! The per-call reconnect state machine for the agent socket. The socket
//! half lives in [`crate::resilience::link`]; this module is synchronous
//! and deterministic so reconnection policy can be tested with an injected
//! clock instead of real sockets.
//!
//! ## State Machine:
//! `Connecting → Connected → Reconnecting → Connected | Failed`
//!
//! A disruption from `Connected` (or a failed dial) yields a redial
//! directive with exponential backoff, until either the attempt limit or
//! the total recovery-time budget is exhausted, whichever comes first.
//! Past that point the supervisor reports `Failed` and the call is handed
//! to the fallback controller.

use crate::clock::Clock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bounds on reconnection behavior for one call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum redial attempts per outage.
    pub max_attempts: u32,
    /// Delay before the first redial; doubles each attempt.
    pub initial_delay: Duration,
    /// Ceiling on the per-attempt delay.
    pub max_delay: Duration,
    /// Total wall-clock allowance across all attempts of one outage.
    pub recovery_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            recovery_budget: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff delay for a 1-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Initial dial in flight.
    Connecting,
    Connected,
    /// Outage in progress; a redial is scheduled or in flight.
    Reconnecting { attempt: u32 },
    /// Recovery budget or attempt limit exhausted.
    Failed,
}

/// What the caller should do after reporting a disruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirective {
    /// Dial again after the given backoff delay.
    Redial { delay: Duration },
    /// Stop trying; escalate to fallback.
    GiveUp,
}

/// Per-call reconnect supervisor.
pub struct ConnectionSupervisor {
    state: LinkState,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    /// When the current outage began; cleared on successful connect.
    outage_started_at: Option<Instant>,
}

impl ConnectionSupervisor {
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: LinkState::Connecting,
            policy,
            clock,
            outage_started_at: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// The socket opened.
    ///
    /// Returns `true` when this is a reconnect (the session-initiation
    /// handshake must be re-sent and the queue flushed once the agent
    /// reports ready again).
    pub fn on_open(&mut self) -> bool {
        let resumed = matches!(self.state, LinkState::Reconnecting { .. });
        self.state = LinkState::Connected;
        self.outage_started_at = None;
        resumed
    }

    /// The socket closed unexpectedly, errored, or a dial failed.
    ///
    /// Decides between another backoff redial and giving up, bounded by
    /// both the attempt count and the recovery-time budget.
    pub fn on_disruption(&mut self) -> LinkDirective {
        let now = self.clock.now();

        let attempt = match self.state {
            LinkState::Connected | LinkState::Connecting => {
                self.outage_started_at = Some(now);
                1
            }
            LinkState::Reconnecting { attempt } => attempt + 1,
            LinkState::Failed => return LinkDirective::GiveUp,
        };

        let elapsed = self
            .outage_started_at
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or(Duration::ZERO);

        if attempt > self.policy.max_attempts || elapsed >= self.policy.recovery_budget {
            self.state = LinkState::Failed;
            return LinkDirective::GiveUp;
        }

        self.state = LinkState::Reconnecting { attempt };
        LinkDirective::Redial {
            delay: self.policy.delay_for(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn supervisor(policy: RetryPolicy) -> (ConnectionSupervisor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let sup = ConnectionSupervisor::new(policy, clock.clone() as Arc<dyn Clock>);
        (sup, clock)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            recovery_budget: Duration::from_secs(300),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(4));
    }

    #[test]
    fn test_reconnect_then_recover() {
        let (mut sup, _clock) = supervisor(RetryPolicy::default());

        assert!(!sup.on_open());
        assert!(sup.is_connected());

        let directive = sup.on_disruption();
        assert!(matches!(directive, LinkDirective::Redial { .. }));
        assert_eq!(sup.state(), LinkState::Reconnecting { attempt: 1 });

        // The redial succeeded; handshake must be replayed
        assert!(sup.on_open());
        assert!(sup.is_connected());
    }

    #[test]
    fn test_attempt_limit_exhaustion() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let (mut sup, _clock) = supervisor(policy);
        sup.on_open();

        assert!(matches!(sup.on_disruption(), LinkDirective::Redial { .. }));
        assert!(matches!(sup.on_disruption(), LinkDirective::Redial { .. }));
        assert_eq!(sup.on_disruption(), LinkDirective::GiveUp);
        assert_eq!(sup.state(), LinkState::Failed);
    }

    /// The recovery-time budget cuts an outage short even when attempts
    /// remain.
    #[test]
    fn test_recovery_budget_exhaustion() {
        let policy = RetryPolicy {
            max_attempts: 100,
            recovery_budget: Duration::from_secs(30),
            ..RetryPolicy::default()
        };
        let (mut sup, clock) = supervisor(policy);
        sup.on_open();

        assert!(matches!(sup.on_disruption(), LinkDirective::Redial { .. }));
        clock.advance(Duration::from_secs(30));
        assert_eq!(sup.on_disruption(), LinkDirective::GiveUp);
        assert_eq!(sup.state(), LinkState::Failed);
    }

    /// A successful reconnect resets the outage clock for the next one.
    #[test]
    fn test_budget_resets_after_recovery() {
        let policy = RetryPolicy {
            max_attempts: 100,
            recovery_budget: Duration::from_secs(30),
            ..RetryPolicy::default()
        };
        let (mut sup, clock) = supervisor(policy);
        sup.on_open();

        sup.on_disruption();
        clock.advance(Duration::from_secs(20));
        sup.on_open();

        // New outage: the previous 20s must not count against it
        clock.advance(Duration::from_secs(15));
        assert!(matches!(sup.on_disruption(), LinkDirective::Redial { .. }));
    }

    /// An initial dial failure retries rather than failing outright.
    #[test]
    fn test_initial_dial_failure_redials() {
        let (mut sup, _clock) = supervisor(RetryPolicy::default());
        assert_eq!(sup.state(), LinkState::Connecting);
        assert!(matches!(sup.on_disruption(), LinkDirective::Redial { .. }));
    }
}
