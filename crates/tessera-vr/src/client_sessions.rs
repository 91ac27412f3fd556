//! Client session management.
//!
//! Every client tags its commands with a random [`ClientId`] and a request
//! number that increases by one per logical request. A retried request keeps
//! its number, so the server can recognise it and answer from the cache
//! instead of executing the command again.
//!
//! The session table is part of the replicated application state: it is
//! updated only when a command commits, it travels inside snapshots, and
//! every replica evicts the same sessions in the same order. A new master
//! therefore deduplicates exactly like the old one.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::OpNumber;

// ============================================================================
// ClientId
// ============================================================================

/// Unique identifier for a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Draws a fresh id from the OS CSPRNG.
    ///
    /// # Panics
    ///
    /// Panics if the OS CSPRNG fails.
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        getrandom::fill(&mut bytes).expect("CSPRNG failure is catastrophic");
        Self(u64::from_le_bytes(bytes))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{:016x}", self.0)
    }
}

// ============================================================================
// CommittedSession
// ============================================================================

/// A committed client session with its cached reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedSession {
    /// The highest request number committed for this client.
    pub request_number: u64,

    /// The operation number where that request was committed.
    ///
    /// All replicas evict the session with the oldest `committed_op`.
    pub committed_op: OpNumber,

    /// The encoded reply produced when the request was applied.
    pub reply: Bytes,
}

/// Result of looking a request up in the session table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCheck {
    /// Not seen before: execute it.
    New,

    /// Already committed: answer with the cached reply.
    Duplicate(Bytes),

    /// Older than the last committed request for this client.
    Stale { last: u64 },
}

// ============================================================================
// ClientSessions
// ============================================================================

/// Configuration for client session management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSessionsConfig {
    /// Maximum number of committed sessions to retain.
    pub max_sessions: usize,
}

impl Default for ClientSessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100_000,
        }
    }
}

impl ClientSessionsConfig {
    /// Configuration for testing (small limits).
    pub fn testing() -> Self {
        Self { max_sessions: 100 }
    }
}

/// Committed client sessions.
///
/// # Invariants
///
/// 1. Request numbers per client only increase
/// 2. `by_op` holds exactly one entry per committed session
/// 3. Eviction is deterministic: the session with the oldest `committed_op` goes first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSessions {
    committed: BTreeMap<ClientId, CommittedSession>,

    /// Eviction order, keyed by the op at which each session last committed.
    by_op: BTreeMap<OpNumber, ClientId>,

    config: ClientSessionsConfig,
}

impl ClientSessions {
    pub fn new(config: ClientSessionsConfig) -> Self {
        Self {
            committed: BTreeMap::new(),
            by_op: BTreeMap::new(),
            config,
        }
    }

    /// Creates a manager with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ClientSessionsConfig::default())
    }

    /// Classifies a request against the committed table.
    pub fn check(&self, client_id: ClientId, request_number: u64) -> SessionCheck {
        match self.committed.get(&client_id) {
            None => SessionCheck::New,
            Some(session) if session.request_number == request_number => {
                SessionCheck::Duplicate(session.reply.clone())
            }
            Some(session) if request_number < session.request_number => SessionCheck::Stale {
                last: session.request_number,
            },
            Some(_) => SessionCheck::New,
        }
    }

    /// Records a committed request and caches its reply.
    pub fn commit(
        &mut self,
        client_id: ClientId,
        request_number: u64,
        committed_op: OpNumber,
        reply: Bytes,
    ) {
        if let Some(previous) = self.committed.get(&client_id) {
            debug_assert!(
                request_number > previous.request_number,
                "request numbers must increase: {} after {}",
                request_number,
                previous.request_number
            );
            self.by_op.remove(&previous.committed_op);
        }

        self.committed.insert(
            client_id,
            CommittedSession {
                request_number,
                committed_op,
                reply,
            },
        );
        self.by_op.insert(committed_op, client_id);

        while self.committed.len() > self.config.max_sessions {
            self.evict_oldest();
        }
        debug_assert_eq!(self.committed.len(), self.by_op.len());
    }

    fn evict_oldest(&mut self) {
        if let Some((op, client_id)) = self.by_op.pop_first() {
            self.committed.remove(&client_id);
            tracing::debug!(client = %client_id, op = %op, "evicted oldest client session");
        }
    }

    pub fn get(&self, client_id: ClientId) -> Option<&CommittedSession> {
        self.committed.get(&client_id)
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }
}

impl Default for ClientSessions {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn reply(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn new_session_has_no_duplicates() {
        let sessions = ClientSessions::with_defaults();
        assert_eq!(sessions.check(ClientId::new(1), 1), SessionCheck::New);
    }

    #[test]
    fn committed_request_is_answered_from_cache() {
        let mut sessions = ClientSessions::with_defaults();
        let client = ClientId::new(7);
        sessions.commit(client, 1, OpNumber::new(3), reply("ok"));

        assert_eq!(sessions.check(client, 1), SessionCheck::Duplicate(reply("ok")));
        assert_eq!(sessions.check(client, 2), SessionCheck::New);
    }

    #[test]
    fn older_request_is_stale() {
        let mut sessions = ClientSessions::with_defaults();
        let client = ClientId::new(7);
        sessions.commit(client, 1, OpNumber::new(1), reply("a"));
        sessions.commit(client, 2, OpNumber::new(2), reply("b"));

        assert_eq!(sessions.check(client, 1), SessionCheck::Stale { last: 2 });
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn deterministic_eviction_by_commit_op() {
        let mut sessions = ClientSessions::new(ClientSessionsConfig { max_sessions: 2 });
        sessions.commit(ClientId::new(1), 1, OpNumber::new(10), reply("1"));
        sessions.commit(ClientId::new(2), 1, OpNumber::new(11), reply("2"));
        // Client 1 commits again, so client 2 now holds the oldest op.
        sessions.commit(ClientId::new(1), 2, OpNumber::new(12), reply("1b"));
        sessions.commit(ClientId::new(3), 1, OpNumber::new(13), reply("3"));

        assert_eq!(sessions.len(), 2);
        assert!(sessions.get(ClientId::new(2)).is_none());
        assert!(sessions.get(ClientId::new(1)).is_some());
        assert!(sessions.get(ClientId::new(3)).is_some());
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(ClientId::random(), ClientId::random());
    }

    proptest! {
        #[test]
        fn prop_eviction_deterministic(
            clients in proptest::collection::vec(0u64..20, 1..60),
            max in 1usize..8,
        ) {
            let build = || {
                let mut sessions = ClientSessions::new(ClientSessionsConfig { max_sessions: max });
                let mut next_request: HashMap<u64, u64> = HashMap::new();
                for (op, client) in clients.iter().enumerate() {
                    let request = next_request.entry(*client).or_insert(0);
                    *request += 1;
                    sessions.commit(
                        ClientId::new(*client),
                        *request,
                        OpNumber::new(op as u64 + 1),
                        Bytes::new(),
                    );
                }
                sessions
            };

            let a = build();
            let b = build();
            prop_assert_eq!(&a, &b);
            prop_assert!(a.len() <= max);
        }
    }
}
