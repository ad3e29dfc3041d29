//! # Call Session Registry
//!
//! The exclusive owner of all live call sessions, keyed by call id.
//!
//! ## Alias Resolution:
//! A session may first be registered under a provisional id (generated
//! before the telephony provider assigns the real call id) and later
//! promoted. The registry keeps an explicit alias table mapping provisional
//! ids to the real key. Resolution is a single map lookup, never a
//! recursive walk, so `get` stays O(1) and both ids resolve to the same
//! session.
//!
//! ## Thread Safety:
//! One `RwLock` guards the session map and alias table together, so a
//! promotion can never be observed half-applied. Many calls interleave on
//! the registry concurrently; each operation holds the lock only for its
//! in-memory work.

use crate::call::session::{CallSession, SessionConfig};
use crate::error::{AppError, AppResult};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a staleness sweep pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub removed: usize,
    /// Non-fatal per-session cleanup failures; the sweep continues past
    /// every one of them.
    pub errors: Vec<String>,
}

struct RegistryInner {
    sessions: HashMap<String, CallSession>,
    /// provisional id -> real session key
    aliases: HashMap<String, String>,
}

/// In-memory store of call sessions with alias indirection.
#[derive(Clone)]
pub struct CallRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    max_concurrent_calls: usize,
}

impl CallRegistry {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                aliases: HashMap::new(),
            })),
            max_concurrent_calls,
        }
    }

    /// Create a session under `call_id`.
    ///
    /// Fails if the id (or an alias for it) already exists, or if the
    /// concurrent-call limit is reached.
    pub fn create(&self, call_id: &str, config: SessionConfig) -> AppResult<()> {
        let mut inner = self.inner.write().unwrap();

        if inner.sessions.len() >= self.max_concurrent_calls {
            return Err(AppError::RateLimit {
                message: format!(
                    "Maximum concurrent calls ({}) reached",
                    self.max_concurrent_calls
                ),
                retry_after: None,
            });
        }

        if Self::resolve(&inner, call_id).is_some() {
            return Err(AppError::BadRequest(format!(
                "Call session '{}' already exists",
                call_id
            )));
        }

        inner
            .sessions
            .insert(call_id.to_string(), CallSession::new(call_id.to_string(), config));
        debug!(call_id, "Call session created");
        Ok(())
    }

    /// Fetch a snapshot of a session, following alias indirection.
    pub fn get(&self, call_id: &str) -> Option<CallSession> {
        let inner = self.inner.read().unwrap();
        let key = Self::resolve(&inner, call_id)?;
        inner.sessions.get(&key).cloned()
    }

    pub fn contains(&self, call_id: &str) -> bool {
        let inner = self.inner.read().unwrap();
        Self::resolve(&inner, call_id).is_some()
    }

    /// Apply a partial update to a session under the registry lock.
    ///
    /// Returns `None` if the id doesn't resolve; otherwise the closure's
    /// return value.
    pub fn update<R>(&self, call_id: &str, f: impl FnOnce(&mut CallSession) -> R) -> Option<R> {
        let mut inner = self.inner.write().unwrap();
        let key = Self::resolve(&inner, call_id)?;
        inner.sessions.get_mut(&key).map(f)
    }

    /// Re-key a session from its provisional id to the provider-assigned
    /// real id, leaving an alias so the provisional id keeps resolving.
    pub fn promote(&self, provisional_id: &str, real_id: &str) -> AppResult<()> {
        if provisional_id == real_id {
            return Ok(());
        }

        let mut inner = self.inner.write().unwrap();

        let key = Self::resolve(&inner, provisional_id).ok_or_else(|| {
            AppError::NotFound(format!("Call session '{}' not found", provisional_id))
        })?;

        if inner.sessions.contains_key(real_id) {
            return Err(AppError::BadRequest(format!(
                "Call session '{}' already exists",
                real_id
            )));
        }

        let mut session = match inner.sessions.remove(&key) {
            Some(session) => session,
            None => {
                return Err(AppError::NotFound(format!(
                    "Call session '{}' not found",
                    provisional_id
                )))
            }
        };
        session.call_id = real_id.to_string();
        inner.sessions.insert(real_id.to_string(), session);

        // Repoint every alias that referenced the old key, then record the
        // old key itself; lookups stay single-hop.
        for target in inner.aliases.values_mut() {
            if *target == key {
                *target = real_id.to_string();
            }
        }
        inner.aliases.insert(key, real_id.to_string());

        debug!(provisional_id, real_id, "Call session promoted to real id");
        Ok(())
    }

    /// Remove a session, drop every alias pointing at it, and force-close
    /// its agent socket if one is open.
    pub fn remove(&self, call_id: &str) -> Option<CallSession> {
        let mut inner = self.inner.write().unwrap();
        let key = Self::resolve(&inner, call_id)?;

        let mut session = inner.sessions.remove(&key)?;
        inner.aliases.retain(|_, target| *target != key);

        if let Some(link) = session.agent_link.take() {
            if let Err(e) = link.close() {
                warn!(call_id = %key, "Agent link close during removal failed: {}", e);
            }
        }

        debug!(call_id = %key, "Call session removed");
        Some(session)
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().unwrap().sessions.len()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.inner.read().unwrap().sessions.keys().cloned().collect()
    }

    /// Remove sessions idle past `max_age`.
    ///
    /// Bounds memory if a termination event is missed. Individual cleanup
    /// failures are collected, not fatal: the sweep always finishes.
    pub fn sweep(&self, max_age: Duration) -> SweepReport {
        let now = Utc::now();
        let max_age_ms = max_age.as_millis() as i64;
        let mut report = SweepReport::default();

        let mut inner = self.inner.write().unwrap();

        let stale: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, session)| session.idle_ms(now) > max_age_ms)
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            if let Some(mut session) = inner.sessions.remove(&key) {
                inner.aliases.retain(|_, target| *target != key);
                if let Some(link) = session.agent_link.take() {
                    if let Err(e) = link.close() {
                        report
                            .errors
                            .push(format!("closing agent link for '{}': {}", key, e));
                    }
                }
                report.removed += 1;
            }
        }

        if report.removed > 0 {
            info!(
                removed = report.removed,
                errors = report.errors.len(),
                "Swept stale call sessions"
            );
        }

        report
    }

    fn resolve(inner: &RegistryInner, call_id: &str) -> Option<String> {
        if inner.sessions.contains_key(call_id) {
            return Some(call_id.to_string());
        }
        inner.aliases.get(call_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::session::test_config;
    use crate::resilience::link::AgentLink;

    fn registry() -> CallRegistry {
        CallRegistry::new(10)
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let registry = registry();
        assert!(registry.create("CA1", test_config()).is_ok());
        assert!(registry.create("CA1", test_config()).is_err());
    }

    #[test]
    fn test_create_enforces_capacity() {
        let registry = CallRegistry::new(2);
        registry.create("CA1", test_config()).unwrap();
        registry.create("CA2", test_config()).unwrap();
        assert!(matches!(
            registry.create("CA3", test_config()),
            Err(AppError::RateLimit { .. })
        ));
    }

    /// A session created under provisional id P then promoted to real id R
    /// resolves under both ids; removing R also removes the alias for P.
    #[test]
    fn test_alias_promotion_and_removal() {
        let registry = registry();
        let provisional = "prov-1234";

        registry.create(provisional, test_config()).unwrap();
        registry.promote(provisional, "CA999").unwrap();

        let by_provisional = registry.get(provisional).unwrap();
        let by_real = registry.get("CA999").unwrap();
        assert_eq!(by_provisional.call_id, "CA999");
        assert_eq!(by_provisional.call_id, by_real.call_id);
        assert_eq!(by_provisional.created_at, by_real.created_at);

        // Updates through either id hit the same session
        registry.update(provisional, |s| s.stream_sid = Some("MZ1".to_string()));
        assert_eq!(registry.get("CA999").unwrap().stream_sid.as_deref(), Some("MZ1"));

        registry.remove("CA999").unwrap();
        assert!(registry.get(provisional).is_none());
        assert!(registry.get("CA999").is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_promote_rejects_taken_real_id() {
        let registry = registry();
        registry.create("prov-1", test_config()).unwrap();
        registry.create("CA1", test_config()).unwrap();
        assert!(registry.promote("prov-1", "CA1").is_err());
    }

    #[test]
    fn test_remove_closes_agent_link() {
        let registry = registry();
        registry.create("CA1", test_config()).unwrap();

        let (link, mut rx) = AgentLink::channel();
        registry.update("CA1", |s| s.agent_link = Some(link));

        registry.remove("CA1").unwrap();
        let cmd = rx.try_recv().expect("close command should be queued");
        assert!(matches!(cmd, crate::resilience::link::AgentCommand::Close));
    }

    #[test]
    fn test_sweep_removes_only_stale_sessions() {
        let registry = registry();
        registry.create("old", test_config()).unwrap();
        registry.create("fresh", test_config()).unwrap();

        // Backdate one session's activity clock
        registry.update("old", |s| {
            s.last_activity_at = Utc::now() - chrono::Duration::seconds(120);
        });

        let report = registry.sweep(Duration::from_secs(60));
        assert_eq!(report.removed, 1);
        assert!(report.errors.is_empty());
        assert!(registry.get("old").is_none());
        assert!(registry.get("fresh").is_some());
    }
}
