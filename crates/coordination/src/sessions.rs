//! Ephemeral session registry.
//!
//! Session records expire on their own; every successful read restarts the
//! expiry (sliding lifetime). The per-user index of session ids never expires
//! and is only a hint: it may name sessions that are long gone, and readers
//! prune such entries when they meet them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use kvcoord_core::{Clock, CoordError, CoordResult, SessionId, SystemClock, UserId, Versioned};
use kvcoord_store::Store;

use crate::config::SessionConfig;
use crate::keys::KeySpace;
use crate::record::{CasOutcome, cas_update, encode, load_versioned};

const MAX_USER_AGENT_BYTES: usize = 512;
const MAX_IP_BYTES: usize = 64;

/// A live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    /// Opaque snapshot of the user taken at login.
    pub user: JsonValue,
    pub user_agent: String,
    pub ip: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Session registry over a shared store.
#[derive(Debug, Clone)]
pub struct SessionRegistry<S: Store> {
    store: S,
    keys: KeySpace,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl<S: Store> SessionRegistry<S> {
    pub fn new(store: S, keys: KeySpace, config: SessionConfig) -> Self {
        Self {
            store,
            keys,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn create_session(
        &self,
        user: UserId,
        snapshot: JsonValue,
        user_agent: impl Into<String>,
        ip: impl Into<String>,
    ) -> CoordResult<Session> {
        let user_agent = user_agent.into();
        let ip = ip.into();
        if user_agent.len() > MAX_USER_AGENT_BYTES {
            return Err(CoordError::validation(format!(
                "user agent longer than {MAX_USER_AGENT_BYTES} bytes"
            )));
        }
        if ip.len() > MAX_IP_BYTES {
            return Err(CoordError::validation(format!(
                "ip longer than {MAX_IP_BYTES} bytes"
            )));
        }

        let now = self.clock.now();
        let session = Session {
            session_id: SessionId::new(),
            user_id: user,
            user: snapshot,
            user_agent,
            ip,
            created_at: now,
            last_activity: now,
        };

        let key = self.keys.session_record(session.session_id);
        let record = encode(&key, &Versioned::new(session.clone()))?;
        self.store.set_ex(&key, &record, self.config.lifetime)?;
        self.store
            .sadd(&self.keys.user_sessions(user), &session.session_id.to_string())?;

        info!(user_id = %user, session_id = %session.session_id, "session created");
        Ok(session)
    }

    /// Look up a session and slide its expiry.
    ///
    /// The refresh is a compare-and-swap on the record, so a session
    /// invalidated concurrently is never brought back. If the refresh keeps
    /// losing to concurrent readers the session is still returned unrefreshed;
    /// one of those readers has just slid it anyway.
    pub fn get_session(&self, user: UserId, id: SessionId) -> CoordResult<Option<Session>> {
        let key = self.keys.session_record(id);
        let now = self.clock.now();
        let lifetime = self.config.lifetime;

        let outcome = cas_update(
            &self.store,
            &key,
            self.config.cas_retries,
            |_: &Session| Some(lifetime),
            |s: &Session| {
                (s.user_id == user).then(|| Session {
                    last_activity: now,
                    ..s.clone()
                })
            },
        );

        match outcome {
            Ok(CasOutcome::Updated(session)) => Ok(Some(session)),
            Ok(CasOutcome::Unchanged(_)) => Ok(None),
            Ok(CasOutcome::Absent) => {
                if self
                    .store
                    .srem(&self.keys.user_sessions(user), &id.to_string())?
                {
                    debug!(user_id = %user, session_id = %id, "pruned stale session index entry");
                }
                Ok(None)
            }
            Err(CoordError::RaceLost { .. }) => Ok(load_versioned::<_, Session>(&self.store, &key)?
                .map(|(_, record)| record.into_inner())
                .filter(|s| s.user_id == user)),
            Err(e) => Err(e),
        }
    }

    /// End one session. `false` if it did not exist for `user`.
    pub fn invalidate_session(&self, user: UserId, id: SessionId) -> CoordResult<bool> {
        let key = self.keys.session_record(id);
        let index = self.keys.user_sessions(user);

        match load_versioned::<_, Session>(&self.store, &key)? {
            Some((_, record)) if record.value.user_id != user => Ok(false),
            Some(_) => {
                self.store.del(&key)?;
                self.store.srem(&index, &id.to_string())?;
                info!(user_id = %user, session_id = %id, "session invalidated");
                Ok(true)
            }
            None => {
                self.store.srem(&index, &id.to_string())?;
                Ok(false)
            }
        }
    }

    /// End every session of `user`. Returns how many were live.
    pub fn invalidate_all_sessions(&self, user: UserId) -> CoordResult<usize> {
        let index = self.keys.user_sessions(user);
        let mut ended = 0;

        for member in self.store.smembers(&index)? {
            if let Ok(id) = member.parse::<SessionId>() {
                let key = self.keys.session_record(id);
                let owned = load_versioned::<_, Session>(&self.store, &key)?
                    .is_some_and(|(_, record)| record.value.user_id == user);
                if owned && self.store.del(&key)? {
                    ended += 1;
                }
            }
            self.store.srem(&index, &member)?;
        }

        info!(user_id = %user, ended, "all sessions invalidated");
        Ok(ended)
    }

    /// Live sessions of `user`, oldest first. Does not slide expiry.
    pub fn list_sessions(&self, user: UserId) -> CoordResult<Vec<Session>> {
        let (mut live, _) = self.scan(user)?;
        live.sort_by_key(|s| s.created_at);
        Ok(live)
    }

    /// Drop index entries whose session is gone. Returns how many.
    pub fn prune_index(&self, user: UserId) -> CoordResult<usize> {
        let (_, pruned) = self.scan(user)?;
        Ok(pruned)
    }

    fn scan(&self, user: UserId) -> CoordResult<(Vec<Session>, usize)> {
        let index = self.keys.user_sessions(user);
        let mut live = Vec::new();
        let mut pruned = 0;

        for member in self.store.smembers(&index)? {
            let session = match member.parse::<SessionId>() {
                Ok(id) => load_versioned::<_, Session>(&self.store, &self.keys.session_record(id))?
                    .map(|(_, record)| record.into_inner())
                    .filter(|s| s.user_id == user),
                Err(_) => None,
            };

            match session {
                Some(s) => live.push(s),
                None => {
                    if self.store.srem(&index, &member)? {
                        pruned += 1;
                    }
                }
            }
        }

        if pruned > 0 {
            debug!(user_id = %user, pruned, "pruned stale session index entries");
        }
        Ok((live, pruned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvcoord_core::ManualClock;
    use kvcoord_store::InMemoryStore;
    use serde_json::json;
    use std::time::Duration;

    const LIFETIME: Duration = Duration::from_secs(600);

    fn registry() -> (Arc<ManualClock>, Arc<InMemoryStore>, SessionRegistry<Arc<InMemoryStore>>) {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let registry = SessionRegistry::new(
            store.clone(),
            KeySpace::new("t"),
            SessionConfig {
                lifetime: LIFETIME,
                cas_retries: 3,
            },
        )
        .with_clock(clock.clone());
        (clock, store, registry)
    }

    fn login(registry: &SessionRegistry<Arc<InMemoryStore>>, user: UserId) -> Session {
        registry
            .create_session(user, json!({ "name": "ada" }), "Mozilla/5.0", "10.0.0.1")
            .unwrap()
    }

    #[test]
    fn get_session_slides_expiry() {
        let (clock, store, registry) = registry();
        let user = UserId::new();
        let session = login(&registry, user);

        clock.advance(Duration::from_secs(500));
        let seen = registry.get_session(user, session.session_id).unwrap().unwrap();
        assert_eq!(seen.last_activity, clock.now());
        assert_eq!(seen.created_at, session.created_at);
        assert_eq!(
            store.ttl(&KeySpace::new("t").session_record(session.session_id)),
            Some(LIFETIME)
        );

        // Past the original expiry, but within the slid one.
        clock.advance(Duration::from_secs(500));
        assert!(registry.get_session(user, session.session_id).unwrap().is_some());
    }

    #[test]
    fn idle_session_expires_and_index_is_pruned() {
        let (clock, store, registry) = registry();
        let user = UserId::new();
        let session = login(&registry, user);

        clock.advance(LIFETIME);
        assert_eq!(registry.get_session(user, session.session_id).unwrap(), None);
        assert!(
            store
                .smembers(&KeySpace::new("t").user_sessions(user))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn session_of_another_user_is_absent() {
        let (_clock, _store, registry) = registry();
        let owner = UserId::new();
        let session = login(&registry, owner);

        assert_eq!(registry.get_session(UserId::new(), session.session_id).unwrap(), None);
        assert!(!registry.invalidate_session(UserId::new(), session.session_id).unwrap());
        assert!(registry.get_session(owner, session.session_id).unwrap().is_some());
    }

    #[test]
    fn invalidated_session_stays_gone() {
        let (_clock, _store, registry) = registry();
        let user = UserId::new();
        let session = login(&registry, user);

        assert!(registry.invalidate_session(user, session.session_id).unwrap());
        assert!(!registry.invalidate_session(user, session.session_id).unwrap());
        assert_eq!(registry.get_session(user, session.session_id).unwrap(), None);
    }

    #[test]
    fn invalidate_all_counts_live_sessions() {
        let (clock, _store, registry) = registry();
        let user = UserId::new();
        login(&registry, user);
        clock.advance(Duration::from_secs(400));
        login(&registry, user);
        login(&registry, user);

        // The first one lapses.
        clock.advance(Duration::from_secs(300));
        assert_eq!(registry.invalidate_all_sessions(user).unwrap(), 2);
        assert!(registry.list_sessions(user).unwrap().is_empty());
    }

    #[test]
    fn list_and_prune_skip_expired_sessions() {
        let (clock, _store, registry) = registry();
        let user = UserId::new();
        let old = login(&registry, user);
        clock.advance(Duration::from_secs(400));
        let fresh = login(&registry, user);
        let newer = login(&registry, user);

        clock.advance(Duration::from_secs(300));
        let live: Vec<SessionId> = registry
            .list_sessions(user)
            .unwrap()
            .iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(live.len(), 2);
        assert!(live.contains(&fresh.session_id) && live.contains(&newer.session_id));
        assert!(!live.contains(&old.session_id));
        assert_eq!(registry.prune_index(user).unwrap(), 0);
    }

    #[test]
    fn prune_index_reports_removed_entries() {
        let (clock, _store, registry) = registry();
        let user = UserId::new();
        login(&registry, user);
        login(&registry, user);

        clock.advance(LIFETIME);
        assert_eq!(registry.prune_index(user).unwrap(), 2);
        assert_eq!(registry.prune_index(user).unwrap(), 0);
    }

    #[test]
    fn oversized_client_fields_are_rejected() {
        let (_clock, _store, registry) = registry();
        let user = UserId::new();
        assert!(matches!(
            registry.create_session(user, JsonValue::Null, "x".repeat(513), "10.0.0.1"),
            Err(CoordError::Validation(_))
        ));
        assert!(matches!(
            registry.create_session(user, JsonValue::Null, "ua", "1".repeat(65)),
            Err(CoordError::Validation(_))
        ));
    }
}
