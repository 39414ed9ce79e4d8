use crate::error::ProtocolError;
use crate::metrics::gauges;
use crate::session::Session;
use dashmap::DashMap;
use dsync_proto::{Envelope, Role};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Process-unique id of an accepted connection.
pub type ConnId = u64;

/// Shared, lockable session record.
pub type SessionRef = Arc<Mutex<Session>>;

/// Handle held in a session slot, used to queue frames to a connection.
///
/// Frames go into the connection's outbound queue; the connection task writes
/// them to the socket one at a time, in queue order.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    id: ConnId,
    tx: mpsc::UnboundedSender<String>,
}

impl PeerHandle {
    /// Wrap the sending half of a connection's outbound queue.
    #[must_use]
    pub const fn new(id: ConnId, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { id, tx }
    }

    /// The connection id.
    #[must_use]
    pub const fn id(&self) -> ConnId {
        self.id
    }

    /// Queue a raw frame. Returns `false` if the connection task is gone.
    pub fn send(&self, frame: String) -> bool {
        self.tx.send(frame).is_ok()
    }

    /// Queue an envelope. Returns `false` if the connection task is gone.
    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        self.send(envelope.to_json())
    }
}

/// Parsed `login` params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginParams {
    /// Role the connection claims.
    pub role: Role,
    /// Session to join.
    pub session_id: String,
}

/// Lock a session, recovering the data if a previous holder panicked.
pub fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Concurrent session-id → session map.
///
/// Sessions are created on the first login for an unseen id and evicted as
/// soon as both of their slots are empty. A second index maps each logged-in
/// connection to its session id so lookups do not scan every session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionRef>,
    memberships: DashMap<ConnId, String>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` under `login.role` in session `login.session_id`,
    /// creating the session if needed.
    ///
    /// A connection that was already logged in is first removed from its
    /// previous session.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::RoleOccupied`] if another connection already
    /// holds that role in that session.
    pub fn register_session(
        &self,
        peer: &PeerHandle,
        login: &LoginParams,
    ) -> Result<SessionRef, ProtocolError> {
        self.unregister_connection(peer.id());

        let session = {
            let entry = self
                .sessions
                .entry(login.session_id.clone())
                .or_insert_with(|| {
                    info!(session_id = %login.session_id, "session created");
                    gauges::inc_sessions_active();
                    Arc::new(Mutex::new(Session::new(login.session_id.clone())))
                });
            let mut guard = lock(entry.value());
            if guard.peer(login.role).is_some() {
                return Err(ProtocolError::RoleOccupied(
                    login.role,
                    login.session_id.clone(),
                ));
            }
            guard.attach(login.role, peer.clone());
            drop(guard);
            Arc::clone(entry.value())
        };

        self.memberships.insert(peer.id(), login.session_id.clone());
        Ok(session)
    }

    /// The session currently holding `conn` under either role.
    #[must_use]
    pub fn get_session(&self, conn: ConnId) -> Option<SessionRef> {
        let session_id = self.memberships.get(&conn)?.value().clone();
        let session = self.sessions.get(&session_id)?.value().clone();
        let is_member = lock(&session).role_of(conn).is_some();
        is_member.then_some(session)
    }

    /// Remove `conn` from its session, if any, and evict the session once it
    /// is empty. Returns the session id and role the connection held.
    pub fn unregister_connection(&self, conn: ConnId) -> Option<(String, Role)> {
        let (_, session_id) = self.memberships.remove(&conn)?;
        let session = self.sessions.get(&session_id)?.value().clone();

        let role = lock(&session).disconnect(conn)?;
        debug!(conn_id = conn, %session_id, %role, "connection unregistered");

        if self
            .sessions
            .remove_if(&session_id, |_, s| lock(s).is_empty())
            .is_some()
        {
            info!(%session_id, "session closed");
            gauges::dec_sessions_active();
        }
        Some((session_id, role))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if there are no live sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_peer(id: ConnId) -> (PeerHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerHandle::new(id, tx), rx)
    }

    fn login(role: Role, session_id: &str) -> LoginParams {
        LoginParams {
            role,
            session_id: session_id.to_string(),
        }
    }

    #[test]
    fn first_login_creates_session() {
        let registry = SessionRegistry::new();
        let (tester, _rx) = make_peer(1);

        let session = registry
            .register_session(&tester, &login(Role::Tester, "abc"))
            .unwrap();
        assert_eq!(lock(&session).id(), "abc");
        assert_eq!(registry.len(), 1);
        assert!(registry.get_session(1).is_some());
    }

    #[test]
    fn both_peers_share_one_session() {
        let registry = SessionRegistry::new();
        let (tester, mut tester_rx) = make_peer(1);
        let (app, _app_rx) = make_peer(2);

        registry
            .register_session(&tester, &login(Role::Tester, "abc"))
            .unwrap();
        registry
            .register_session(&app, &login(Role::App, "abc"))
            .unwrap();

        assert_eq!(registry.len(), 1);
        let a = registry.get_session(1).unwrap();
        let b = registry.get_session(2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let env = Envelope::parse(&tester_rx.try_recv().unwrap()).unwrap();
        assert_eq!(env.kind, "appConnected");
    }

    #[test]
    fn occupied_role_is_refused_and_keeps_occupant() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = make_peer(1);
        let (second, _rx2) = make_peer(2);

        registry
            .register_session(&first, &login(Role::App, "abc"))
            .unwrap();
        let err = registry
            .register_session(&second, &login(Role::App, "abc"))
            .unwrap_err();
        assert_eq!(err, ProtocolError::RoleOccupied(Role::App, "abc".into()));

        let session = registry.get_session(1).unwrap();
        assert_eq!(lock(&session).app().map(PeerHandle::id), Some(1));
        assert!(registry.get_session(2).is_none());
    }

    #[test]
    fn unknown_connection_has_no_session() {
        let registry = SessionRegistry::new();
        assert!(registry.get_session(42).is_none());
        assert!(registry.unregister_connection(42).is_none());
    }

    #[test]
    fn unregister_last_peer_evicts_session() {
        let registry = SessionRegistry::new();
        let (tester, _rx) = make_peer(1);
        registry
            .register_session(&tester, &login(Role::Tester, "abc"))
            .unwrap();

        assert_eq!(
            registry.unregister_connection(1),
            Some(("abc".to_string(), Role::Tester))
        );
        assert!(registry.is_empty());
        assert!(registry.get_session(1).is_none());
    }

    #[test]
    fn unregister_one_peer_keeps_session_and_notifies() {
        let registry = SessionRegistry::new();
        let (tester, mut tester_rx) = make_peer(1);
        let (app, _app_rx) = make_peer(2);
        registry
            .register_session(&tester, &login(Role::Tester, "abc"))
            .unwrap();
        registry
            .register_session(&app, &login(Role::App, "abc"))
            .unwrap();
        let _ = tester_rx.try_recv();

        registry.unregister_connection(2);

        assert_eq!(registry.len(), 1);
        let env = Envelope::parse(&tester_rx.try_recv().unwrap()).unwrap();
        assert_eq!(env.kind, "appDisconnected");
    }

    #[test]
    fn relogin_moves_connection_between_sessions() {
        let registry = SessionRegistry::new();
        let (tester, _rx) = make_peer(1);
        registry
            .register_session(&tester, &login(Role::Tester, "one"))
            .unwrap();
        registry
            .register_session(&tester, &login(Role::Tester, "two"))
            .unwrap();

        assert_eq!(registry.len(), 1);
        let session = registry.get_session(1).unwrap();
        assert_eq!(lock(&session).id(), "two");
    }

    #[test]
    fn distinct_sessions_are_independent() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = make_peer(1);
        let (b, _rx_b) = make_peer(2);
        registry
            .register_session(&a, &login(Role::App, "one"))
            .unwrap();
        registry
            .register_session(&b, &login(Role::App, "two"))
            .unwrap();
        assert_eq!(registry.len(), 2);

        registry.unregister_connection(1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get_session(2).is_some());
    }

    #[test]
    fn concurrent_registration_of_distinct_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let (peer, _rx) = make_peer(i);
                    registry
                        .register_session(&peer, &login(Role::Tester, &format!("s{i}")))
                        .unwrap();
                    registry.unregister_connection(i);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
