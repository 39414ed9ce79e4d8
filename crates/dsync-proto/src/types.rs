//! Peer roles and reserved protocol constants.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two peer kinds a connection can register as within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The application instance under test.
    App,
    /// The test-orchestration process driving the app.
    Tester,
}

impl Role {
    /// The role on the other end of a session.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::App => Self::Tester,
            Self::Tester => Self::App,
        }
    }

    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Tester => "tester",
        }
    }

    /// Parse a wire role name. Only the exact lowercase names are accepted.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "app" => Some(Self::App),
            "tester" => Some(Self::Tester),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope `type` values with protocol-level meaning.
pub mod message_type {
    /// Client → server handshake registering a connection in a session.
    pub const LOGIN: &str = "login";
    /// Server → client reply to a successful login.
    pub const LOGIN_SUCCESS: &str = "loginSuccess";
    /// Server → tester report of a message that could not be processed.
    pub const ERROR: &str = "error";
    /// Server → tester: the app joined the session.
    pub const APP_CONNECTED: &str = "appConnected";
    /// Server → tester: the app left the session.
    pub const APP_DISCONNECTED: &str = "appDisconnected";
    /// Server → app: the tester left the session.
    pub const TESTER_DISCONNECTED: &str = "testerDisconnected";
    /// App → tester: the app finished loading and is idle.
    pub const READY: &str = "ready";
    /// Tester → app status poll.
    pub const CURRENT_STATUS: &str = "currentStatus";
    /// App → tester: the main thread looks stuck. Carries `params.threadDump`.
    pub const APP_NONRESPONSIVE: &str = "AppNonresponsiveDetected";
    /// App → tester: the app is about to die. Carries `params.errorDetails`.
    pub const APP_WILL_TERMINATE: &str = "AppWillTerminateWithError";
}

/// Negative message ids that the client counter never produces.
pub mod reserved_id {
    use crate::MessageId;

    /// Sent with `appConnected` notifications.
    pub const APP_CONNECTED: MessageId = -9999;
    /// Sent with `appDisconnected` notifications.
    pub const APP_DISCONNECTED: MessageId = -9998;
    /// Used by control probes (ready, reload) so they stand out in logs.
    pub const READY_PROBE: MessageId = -1000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::App).unwrap(), "\"app\"");
        assert_eq!(serde_json::to_string(&Role::Tester).unwrap(), "\"tester\"");
    }

    #[test]
    fn role_from_wire_is_exact() {
        assert_eq!(Role::from_wire("app"), Some(Role::App));
        assert_eq!(Role::from_wire("tester"), Some(Role::Tester));
        assert_eq!(Role::from_wire("App"), None);
        assert_eq!(Role::from_wire(""), None);
    }

    #[test]
    fn opposite_roles() {
        assert_eq!(Role::App.opposite(), Role::Tester);
        assert_eq!(Role::Tester.opposite(), Role::App);
    }
}
