use dsync_proto::{EnvelopeError, Role};
use thiserror::Error;

/// Errors that end a connection task.
#[derive(Error, Debug)]
pub enum ServerError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single inbound message could not be processed.
///
/// Protocol errors are scoped to the offending message. They are reported to
/// the session's tester when there is one, and logged otherwise.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not a well-formed envelope.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// Login without a params object.
    #[error("invalid login action received, it has no .params")]
    LoginMissingParams,
    /// Login whose `params.role` is not `app` or `tester`.
    #[error("invalid login action received, it has invalid .role")]
    LoginInvalidRole,
    /// Login without a `params.sessionId`, or with an empty one.
    #[error("invalid login action received, it has no sessionId")]
    LoginMissingSessionId,
    /// Login whose `params.sessionId` is not a string.
    #[error("invalid login action received, it has a non-string sessionId")]
    LoginNonStringSessionId,
    /// The requested role is already taken in that session.
    #[error("the {0} is already connected to session {1}")]
    RoleOccupied(Role, String),
    /// A non-login action arrived before a successful login.
    #[error("action `{0}` dispatched too early, there is no session to use")]
    NoSession(String),
    /// The connection is not one of the session's peers.
    #[error("the connection is not a member of this session")]
    NotAMember,
    /// The other side of the session is not connected.
    #[error("cannot forward the message to the {0}")]
    NoDestination(Role),
}

impl ProtocolError {
    /// Short label for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Envelope(_) => "invalid_message",
            Self::LoginMissingParams
            | Self::LoginInvalidRole
            | Self::LoginMissingSessionId
            | Self::LoginNonStringSessionId => "invalid_login",
            Self::RoleOccupied(..) => "role_occupied",
            Self::NoSession(_) | Self::NotAMember => "no_session",
            Self::NoDestination(_) => "no_destination",
        }
    }
}
