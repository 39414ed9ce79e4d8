use crate::socket::SocketError;
use dsync_proto::types::{message_type, reserved_id};
use dsync_proto::{Envelope, MessageId, Role};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Failures surfaced by client actions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// The call never got a reply.
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// The broker or the app answered with an `error` envelope.
    #[error("{0}")]
    Remote(String),
    /// The app reported that the invocation failed.
    #[error("test failed: {0}")]
    TestFailed(String),
    /// The app could not capture its view hierarchy.
    #[error("failed to capture view hierarchy: {0}")]
    CaptureViewHierarchy(String),
    /// The reply had a type the action does not accept.
    #[error("was expecting '{expected}', got '{actual}'")]
    UnexpectedResponse {
        /// Reply type the action waits for.
        expected: &'static str,
        /// Reply type that arrived.
        actual: String,
    },
}

/// One request the tester can make, with its own reply rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Join a session as the tester.
    Login {
        /// Session to join.
        session_id: String,
    },
    /// Ask the app whether it finished loading.
    Ready,
    /// Reload the React Native bundle and wait for the app to be ready again.
    ReloadReactNative,
    /// Run one invocation on the app.
    Invoke(Value),
    /// Tell the app the test run is over.
    Cleanup {
        /// Whether the app should stop its test runner.
        stop_runner: bool,
    },
    /// Poll the app's synchronization status.
    CurrentStatus,
    /// Wait until the app is in the background.
    WaitForBackground,
    /// Wait until the app is active again.
    WaitForActive,
    /// Shake the device.
    Shake,
    /// Rotate the device.
    SetOrientation(String),
    /// Change the app's synchronization settings.
    SetSyncSettings(Value),
    /// Hand a payload (URL, notification, ...) to the app.
    DeliverPayload(Value),
    /// Dump the app's view hierarchy.
    CaptureViewHierarchy {
        /// Where the app should write the dump.
        view_hierarchy_url: String,
    },
    /// Start or stop an Instruments recording; no path stops it.
    SetInstrumentsRecordingState {
        /// Output path of the recording.
        recording_path: Option<String>,
        /// Sampling interval in milliseconds.
        sampling_interval: Option<u64>,
    },
}

impl Action {
    /// The outbound `type`.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Login { .. } => message_type::LOGIN,
            Self::Ready => "isReady",
            Self::ReloadReactNative => "reactNativeReload",
            Self::Invoke(_) => "invoke",
            Self::Cleanup { .. } => "cleanup",
            Self::CurrentStatus => message_type::CURRENT_STATUS,
            Self::WaitForBackground => "waitForBackground",
            Self::WaitForActive => "waitForActive",
            Self::Shake => "shakeDevice",
            Self::SetOrientation(_) => "setOrientation",
            Self::SetSyncSettings(_) => "setSyncSettings",
            Self::DeliverPayload(_) => "deliverPayload",
            Self::CaptureViewHierarchy { .. } => "captureViewHierarchy",
            Self::SetInstrumentsRecordingState { .. } => "setRecordingState",
        }
    }

    /// The reply `type` that completes this action.
    #[must_use]
    pub const fn expected_reply(&self) -> &'static str {
        match self {
            Self::Login { .. } => message_type::LOGIN_SUCCESS,
            Self::Ready | Self::ReloadReactNative => message_type::READY,
            Self::Invoke(_) => "invokeResult",
            Self::Cleanup { .. } => "cleanupDone",
            Self::CurrentStatus => "currentStatusResult",
            Self::WaitForBackground => "waitForBackgroundDone",
            Self::WaitForActive => "waitForActiveDone",
            Self::Shake => "shakeDeviceDone",
            Self::SetOrientation(_) => "setOrientationDone",
            Self::SetSyncSettings(_) => "setSyncSettingsDone",
            Self::DeliverPayload(_) => "deliverPayloadDone",
            Self::CaptureViewHierarchy { .. } => "captureViewHierarchyDone",
            Self::SetInstrumentsRecordingState { .. } => "setRecordingStateDone",
        }
    }

    /// Fixed id for control actions; `None` lets the socket assign one.
    #[must_use]
    pub const fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::Ready | Self::ReloadReactNative => Some(reserved_id::READY_PROBE),
            _ => None,
        }
    }

    /// The outbound `params` object.
    #[must_use]
    pub fn params(&self) -> Value {
        match self {
            Self::Login { session_id } => json!({
                "sessionId": session_id,
                "role": Role::Tester.as_str(),
            }),
            Self::Invoke(invocation) => invocation.clone(),
            Self::Cleanup { stop_runner } => json!({ "stopRunner": stop_runner }),
            Self::SetOrientation(orientation) => json!({ "orientation": orientation }),
            Self::SetSyncSettings(params) | Self::DeliverPayload(params) => params.clone(),
            Self::CaptureViewHierarchy { view_hierarchy_url } => {
                json!({ "viewHierarchyURL": view_hierarchy_url })
            }
            Self::SetInstrumentsRecordingState {
                recording_path,
                sampling_interval,
            } => {
                let mut params = Map::new();
                if let Some(path) = recording_path {
                    params.insert("recordingPath".into(), json!(path));
                }
                if let Some(interval) = sampling_interval {
                    params.insert("samplingInterval".into(), json!(interval));
                }
                Value::Object(params)
            }
            Self::Ready
            | Self::ReloadReactNative
            | Self::CurrentStatus
            | Self::WaitForBackground
            | Self::WaitForActive
            | Self::Shake => json!({}),
        }
    }

    /// The envelope to send; the socket fills in the id.
    #[must_use]
    pub fn envelope(&self) -> Envelope {
        Envelope::new(self.type_name()).with_params(self.params())
    }

    /// Turn the reply into the action's result.
    ///
    /// Actions without a result return `Value::Null`.
    ///
    /// # Errors
    ///
    /// Fails on an `error` reply, on a reply of the wrong type, and on the
    /// failure replies specific to `invoke` and `captureViewHierarchy`.
    pub fn handle(&self, reply: Envelope) -> Result<Value, ClientError> {
        if reply.is(message_type::ERROR) {
            return Err(ClientError::Remote(describe(reply.param("error"))));
        }
        if matches!(self, Self::Invoke(_)) && reply.is("testFailed") {
            return Err(ClientError::TestFailed(describe(reply.param("details"))));
        }
        if !reply.is(self.expected_reply()) {
            return Err(ClientError::UnexpectedResponse {
                expected: self.expected_reply(),
                actual: reply.kind,
            });
        }

        match self {
            Self::CaptureViewHierarchy { .. } => {
                if let Some(err) = reply.param("captureViewHierarchyError") {
                    return Err(ClientError::CaptureViewHierarchy(describe(Some(err))));
                }
                Ok(reply.params.unwrap_or(Value::Null))
            }
            Self::Invoke(_) | Self::CurrentStatus => Ok(reply.params.unwrap_or(Value::Null)),
            _ => Ok(Value::Null),
        }
    }
}

fn describe(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "unknown error".to_string(),
    }
}
