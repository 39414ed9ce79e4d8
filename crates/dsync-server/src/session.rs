use crate::error::ProtocolError;
use crate::metrics::counters;
use crate::registry::{ConnId, PeerHandle};
use dsync_proto::types::{message_type, reserved_id};
use dsync_proto::{Envelope, Role};
use tracing::debug;

/// The pairing record for one session id.
///
/// Holds at most one app and one tester. Changing a role slot notifies the
/// other side: the tester hears about the app coming and going, the app hears
/// about the tester leaving. Nothing is sent to the app when a tester joins;
/// no app implementation consumes such an event.
#[derive(Debug)]
pub struct Session {
    id: String,
    app: Option<PeerHandle>,
    tester: Option<PeerHandle>,
}

impl Session {
    /// Create an empty session.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            app: None,
            tester: None,
        }
    }

    /// The session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The connection holding `role`, if any.
    #[must_use]
    pub fn peer(&self, role: Role) -> Option<&PeerHandle> {
        match role {
            Role::App => self.app.as_ref(),
            Role::Tester => self.tester.as_ref(),
        }
    }

    /// The connected app, if any.
    #[must_use]
    pub fn app(&self) -> Option<&PeerHandle> {
        self.app.as_ref()
    }

    /// The connected tester, if any.
    #[must_use]
    pub fn tester(&self) -> Option<&PeerHandle> {
        self.tester.as_ref()
    }

    /// Returns `true` once both slots are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.app.is_none() && self.tester.is_none()
    }

    /// The role `conn` holds in this session, if it is a member.
    #[must_use]
    pub fn role_of(&self, conn: ConnId) -> Option<Role> {
        if self.tester.as_ref().is_some_and(|p| p.id() == conn) {
            Some(Role::Tester)
        } else if self.app.as_ref().is_some_and(|p| p.id() == conn) {
            Some(Role::App)
        } else {
            None
        }
    }

    /// Put `peer` into the `role` slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already occupied. The registry checks occupancy
    /// before calling this, so reaching the panic is a bug in the broker.
    pub fn attach(&mut self, role: Role, peer: PeerHandle) {
        assert!(
            self.peer(role).is_none(),
            "the {role} is already connected to session {}",
            self.id
        );
        *self.slot_mut(role) = Some(peer);
        debug!(session_id = %self.id, %role, "peer attached");

        if role == Role::App {
            if let Some(tester) = &self.tester {
                tester.send_envelope(
                    &Envelope::new(message_type::APP_CONNECTED).with_id(reserved_id::APP_CONNECTED),
                );
            }
        }
    }

    /// Clear the `role` slot and notify the remaining peer.
    pub fn detach(&mut self, role: Role) -> Option<PeerHandle> {
        let previous = self.slot_mut(role).take();
        debug!(session_id = %self.id, %role, "peer detached");

        match role {
            Role::App => {
                if let Some(tester) = &self.tester {
                    tester.send_envelope(
                        &Envelope::new(message_type::APP_DISCONNECTED)
                            .with_id(reserved_id::APP_DISCONNECTED),
                    );
                }
            }
            Role::Tester => {
                if let Some(app) = &self.app {
                    app.send_envelope(&Envelope::new(message_type::TESTER_DISCONNECTED));
                }
            }
        }
        previous
    }

    /// Remove `conn` from whichever slot it holds.
    ///
    /// Returns the role it held, or `None` if it was not a member.
    pub fn disconnect(&mut self, conn: ConnId) -> Option<Role> {
        let role = self.role_of(conn)?;
        self.detach(role);
        Some(role)
    }

    /// Forward a raw frame from `from` to the opposite role, unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::NoDestination`] if the other side is absent
    /// or its connection is already gone.
    pub fn carry(&self, from: ConnId, frame: &str) -> Result<(), ProtocolError> {
        let role = self.role_of(from).ok_or(ProtocolError::NotAMember)?;
        let dest_role = role.opposite();
        let dest = self
            .peer(dest_role)
            .ok_or(ProtocolError::NoDestination(dest_role))?;
        if !dest.send(frame.to_string()) {
            return Err(ProtocolError::NoDestination(dest_role));
        }
        counters::actions_relayed_total(role.as_str());
        Ok(())
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<PeerHandle> {
        match role {
            Role::App => &mut self.app,
            Role::Tester => &mut self.tester,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_peer(id: ConnId) -> (PeerHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerHandle::new(id, tx), rx)
    }

    fn next_envelope(rx: &mut mpsc::UnboundedReceiver<String>) -> Envelope {
        let text = rx.try_recv().expect("expected a queued frame");
        Envelope::parse(&text).unwrap()
    }

    #[test]
    fn app_attach_notifies_present_tester() {
        let mut session = Session::new("abc");
        let (tester, mut tester_rx) = make_peer(1);
        let (app, _app_rx) = make_peer(2);

        session.attach(Role::Tester, tester);
        session.attach(Role::App, app);

        let env = next_envelope(&mut tester_rx);
        assert_eq!(env.kind, "appConnected");
        assert_eq!(env.message_id, Some(reserved_id::APP_CONNECTED));
        assert!(tester_rx.try_recv().is_err());
    }

    #[test]
    fn tester_attach_does_not_notify_app() {
        let mut session = Session::new("abc");
        let (app, mut app_rx) = make_peer(1);
        let (tester, _tester_rx) = make_peer(2);

        session.attach(Role::App, app);
        session.attach(Role::Tester, tester);

        assert!(app_rx.try_recv().is_err());
    }

    #[test]
    fn app_detach_emits_exactly_one_app_disconnected() {
        let mut session = Session::new("abc");
        let (tester, mut tester_rx) = make_peer(1);
        let (app, _app_rx) = make_peer(2);
        session.attach(Role::Tester, tester);
        session.attach(Role::App, app);
        let _ = next_envelope(&mut tester_rx);

        assert_eq!(session.disconnect(2), Some(Role::App));

        let env = next_envelope(&mut tester_rx);
        assert_eq!(env.kind, "appDisconnected");
        assert!(tester_rx.try_recv().is_err());
        assert!(session.app().is_none());
    }

    #[test]
    fn tester_detach_emits_exactly_one_tester_disconnected() {
        let mut session = Session::new("abc");
        let (app, mut app_rx) = make_peer(1);
        let (tester, _tester_rx) = make_peer(2);
        session.attach(Role::App, app);
        session.attach(Role::Tester, tester);

        assert_eq!(session.disconnect(2), Some(Role::Tester));

        let env = next_envelope(&mut app_rx);
        assert_eq!(env.kind, "testerDisconnected");
        assert!(app_rx.try_recv().is_err());
    }

    #[test]
    fn detach_without_other_peer_emits_nothing() {
        let mut session = Session::new("abc");
        let (app, mut app_rx) = make_peer(1);
        session.attach(Role::App, app);
        assert_eq!(session.disconnect(1), Some(Role::App));
        assert!(app_rx.try_recv().is_err());
        assert!(session.is_empty());
    }

    #[test]
    fn disconnect_of_non_member_is_none() {
        let mut session = Session::new("abc");
        let (app, _rx) = make_peer(1);
        session.attach(Role::App, app);
        assert_eq!(session.disconnect(99), None);
        assert!(session.app().is_some());
    }

    #[test]
    #[should_panic(expected = "is already connected")]
    fn attaching_occupied_role_panics() {
        let mut session = Session::new("abc");
        let (first, _rx1) = make_peer(1);
        let (second, _rx2) = make_peer(2);
        session.attach(Role::App, first);
        session.attach(Role::App, second);
    }

    #[test]
    fn carry_forwards_frame_verbatim() {
        let mut session = Session::new("abc");
        let (tester, _tester_rx) = make_peer(1);
        let (app, mut app_rx) = make_peer(2);
        session.attach(Role::Tester, tester);
        session.attach(Role::App, app);

        let frame = r#"{"type":"invoke", "messageId":7,"params":{"x":[1,2]}}"#;
        session.carry(1, frame).unwrap();
        assert_eq!(app_rx.try_recv().unwrap(), frame);
    }

    #[test]
    fn carry_without_destination_fails() {
        let mut session = Session::new("abc");
        let (tester, _tester_rx) = make_peer(1);
        session.attach(Role::Tester, tester);

        let err = session.carry(1, "{}").unwrap_err();
        assert_eq!(err, ProtocolError::NoDestination(Role::App));
    }

    #[test]
    fn carry_to_dropped_connection_fails() {
        let mut session = Session::new("abc");
        let (tester, _tester_rx) = make_peer(1);
        let (app, app_rx) = make_peer(2);
        session.attach(Role::Tester, tester);
        session.attach(Role::App, app);
        drop(app_rx);

        let err = session.carry(1, "{}").unwrap_err();
        assert_eq!(err, ProtocolError::NoDestination(Role::App));
    }
}
