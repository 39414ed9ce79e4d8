use crate::action::{Action, ClientError};
use crate::config::ClientConfig;
use crate::socket::{CorrelatedSocket, SocketError};
use dsync_proto::types::message_type;
use dsync_proto::Envelope;
use serde_json::Value;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Readiness signals and flags shared with the socket callbacks.
struct ClientState {
    /// The app is present in the session.
    connected: watch::Sender<bool>,
    /// The app finished loading.
    ready: watch::Sender<bool>,
    pending_crash: Mutex<Option<Value>>,
    successful_test_run: AtomicBool,
    /// Bumped to cancel every running stall watchdog.
    watchdog_epoch: watch::Sender<u64>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            connected: watch::channel(false).0,
            ready: watch::channel(false).0,
            pending_crash: Mutex::new(None),
            successful_test_run: AtomicBool::new(true),
            watchdog_epoch: watch::channel(0).0,
        }
    }

    /// The app is gone: both signals go back to unresolved.
    fn rearm(&self) {
        self.connected.send_replace(false);
        self.ready.send_replace(false);
    }
}

/// Aborts the stall watchdog when the watched call settles, however it ends.
struct WatchdogGuard(JoinHandle<()>);

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn resolved(signal: &watch::Sender<bool>) {
    let mut rx = signal.subscribe();
    let _ = rx.wait_for(|resolved| *resolved).await;
}

async fn perform(socket: &CorrelatedSocket, action: &Action) -> Result<Value, ClientError> {
    let reply = socket.send(action.envelope(), action.message_id()).await?;
    action.handle(reply)
}

/// Tester-side synchronization client.
///
/// Logs into a session over a [`CorrelatedSocket`], tracks whether the app
/// is connected and ready, and exposes the action API. App disconnects and
/// crashes reject every call in flight.
pub struct Client {
    config: ClientConfig,
    socket: CorrelatedSocket,
    state: Arc<ClientState>,
}

impl Client {
    /// Build a client; nothing is sent until [`Client::connect`].
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let socket = CorrelatedSocket::new(config.server.clone());
        let state = Arc::new(ClientState::new());
        let pending = socket.pending();

        socket.set_event_callback(message_type::APP_DISCONNECTED, {
            let state = Arc::clone(&state);
            let pending = Arc::clone(&pending);
            move |_: &Envelope| {
                state.rearm();
                let rejected = pending.reject_all(&SocketError::AppDisconnected);
                info!(event = "APP_DISCONNECTED", rejected, "app disconnected");
            }
        });

        socket.set_event_callback(message_type::APP_CONNECTED, {
            let state = Arc::clone(&state);
            move |_: &Envelope| {
                state.connected.send_replace(true);
                info!(event = "APP_CONNECTED", "app connected");
            }
        });

        socket.set_event_callback(message_type::READY, {
            let state = Arc::clone(&state);
            move |_: &Envelope| {
                state.ready.send_replace(true);
            }
        });

        socket.set_event_callback(message_type::APP_NONRESPONSIVE, |envelope: &Envelope| {
            let thread_dump = envelope.param_str("threadDump").unwrap_or("<no thread dump>");
            warn!(
                event = "APP_NONRESPONSIVE",
                "Application nonresponsiveness detected!\n\
                 On Android, this could imply an ANR alert, which evidently causes tests to fail.\n\
                 Native main-thread stacktrace from the device:\n{thread_dump}"
            );
        });

        socket.set_event_callback(message_type::APP_WILL_TERMINATE, {
            let state = Arc::clone(&state);
            move |envelope: &Envelope| {
                let details = envelope.param("errorDetails").cloned().unwrap_or(Value::Null);
                let summary = match &details {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                *lock(&state.pending_crash) = Some(details);
                let rejected = pending.reject_all(&SocketError::AppCrashed(summary));
                warn!(event = "APP_CRASH", rejected, "app is terminating with an error");
            }
        });

        Self {
            config,
            socket,
            state,
        }
    }

    /// The configuration this client was built with.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open the socket and log in as the tester.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be opened or the login is refused. A
    /// refused login leaves the socket open.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.socket.open().await?;
        self.send_action(Action::Login {
            session_id: self.config.session_id.clone(),
        })
        .await?;
        info!(session_id = %self.config.session_id, "logged in");
        Ok(())
    }

    /// Whether the app is present in the session.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.state.connected.borrow()
    }

    /// Whether the app reported that it finished loading.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.state.ready.borrow()
    }

    /// Wait until the app is present in the session.
    pub async fn wait_until_connected(&self) {
        resolved(&self.state.connected).await;
    }

    /// Wait for the app to connect, then probe it unless it already said it
    /// is ready.
    ///
    /// # Errors
    ///
    /// Fails if the probe is rejected.
    pub async fn wait_until_ready(&self) -> Result<(), ClientError> {
        self.wait_until_connected().await;
        if !self.is_ready() {
            self.send_action(Action::Ready).await?;
            self.state.ready.send_replace(true);
        }
        Ok(())
    }

    /// Send one action and turn its reply into a result.
    ///
    /// Every action except login and status polls is watched: while it is
    /// outstanding and the app is connected, the app status is logged every
    /// `debug_synchronization_ms`.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the call is rejected, or the action's own
    /// failure for its reply.
    pub async fn send_action(&self, action: Action) -> Result<Value, ClientError> {
        let _watchdog = self.arm_watchdog(&action);
        perform(&self.socket, &action).await
    }

    fn arm_watchdog(&self, action: &Action) -> Option<WatchdogGuard> {
        if self.config.debug_synchronization_ms == 0
            || matches!(action, Action::Login { .. } | Action::CurrentStatus)
        {
            return None;
        }

        let period = Duration::from_millis(self.config.debug_synchronization_ms);
        let socket = self.socket.clone();
        let state = Arc::clone(&self.state);
        let mut cancelled = self.state.watchdog_epoch.subscribe();

        Some(WatchdogGuard(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(period) => {}
                    _ = cancelled.changed() => return,
                }
                let connected = *state.connected.borrow();
                if !connected {
                    return;
                }
                match perform(&socket, &Action::CurrentStatus).await {
                    Ok(status) => info!(event = "CurrentStatus", %status, "app status"),
                    Err(e) => debug!("status poll failed: {e}"),
                }
            }
        })))
    }

    /// Run one invocation on the app.
    ///
    /// # Errors
    ///
    /// Any failure also marks the run unsuccessful for [`Client::cleanup`].
    pub async fn execute(&self, invocation: Value) -> Result<Value, ClientError> {
        let result = self.send_action(Action::Invoke(invocation)).await;
        if result.is_err() {
            self.state.successful_test_run.store(false, Ordering::SeqCst);
        }
        result
    }

    /// End the run: tell a connected, non-crashed app to clean up, then
    /// close the socket if it is still open.
    ///
    /// # Errors
    ///
    /// Fails if the cleanup action is rejected.
    pub async fn cleanup(&self) -> Result<(), ClientError> {
        self.state.watchdog_epoch.send_modify(|epoch| *epoch += 1);

        let crash_pending = lock(&self.state.pending_crash).is_some();
        if self.is_connected() && !crash_pending {
            if self.socket.is_open() {
                let stop_runner = self.state.successful_test_run.load(Ordering::SeqCst);
                self.send_action(Action::Cleanup { stop_runner }).await?;
            }
            self.state.connected.send_replace(false);
        }

        if self.socket.is_open() {
            self.socket.close().await?;
        }
        Ok(())
    }

    /// Take the crash payload the app reported, if any.
    pub fn get_pending_crash_and_reset(&self) -> Option<Value> {
        lock(&self.state.pending_crash).take()
    }

    /// Log every call still waiting for the app (status polls excluded) and
    /// stop tracking them. Returns the dump, or `None` if nothing is pending.
    ///
    /// The calls are not rejected: a late reply or a later disconnect still
    /// settles them.
    pub fn dump_pending_requests(&self, test_name: Option<&str>) -> Option<String> {
        let pending = self.socket.pending();
        let messages: Vec<Envelope> = pending
            .snapshot()
            .into_iter()
            .filter(|message| !message.is(message_type::CURRENT_STATUS))
            .collect();
        if messages.is_empty() {
            return None;
        }

        let mut dump = String::from("App has not responded to the network requests below:");
        for message in &messages {
            let id = message
                .message_id
                .map_or_else(|| "null".to_string(), |id| id.to_string());
            let params = message
                .params
                .as_ref()
                .map_or_else(|| "null".to_string(), Value::to_string);
            let _ = write!(dump, "\n  (id = {id}) {}: {params}", message.kind);
        }
        let notice = match test_name {
            Some(name) => format!("That might be the reason why the test \"{name}\" has timed out."),
            None => "Unanswered requests might result in timeouts in tests.".to_string(),
        };
        let _ = write!(dump, "\n\n{notice}\n");

        warn!(event = "PENDING_REQUESTS", "{dump}");
        pending.detach_all();
        Some(dump)
    }

    /// Subscribe to unsolicited messages of type `kind`.
    pub fn set_event_callback<F>(&self, kind: impl Into<String>, callback: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.socket.set_event_callback(kind, callback);
    }

    /// Reload the React Native bundle; the app counts as not ready until it
    /// answers.
    ///
    /// # Errors
    ///
    /// Fails if the reload is rejected.
    pub async fn reload_react_native(&self) -> Result<(), ClientError> {
        self.state.ready.send_replace(false);
        self.send_action(Action::ReloadReactNative).await?;
        self.state.ready.send_replace(true);
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the action is rejected.
    pub async fn wait_for_background(&self) -> Result<(), ClientError> {
        self.send_action(Action::WaitForBackground).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the action is rejected.
    pub async fn wait_for_active(&self) -> Result<(), ClientError> {
        self.send_action(Action::WaitForActive).await?;
        Ok(())
    }

    /// Ask the app to write its view hierarchy to `view_hierarchy_url`.
    ///
    /// # Errors
    ///
    /// Fails if the app reports a capture error.
    pub async fn capture_view_hierarchy(
        &self,
        view_hierarchy_url: &str,
    ) -> Result<Value, ClientError> {
        self.send_action(Action::CaptureViewHierarchy {
            view_hierarchy_url: view_hierarchy_url.to_string(),
        })
        .await
    }

    /// The app's synchronization status.
    ///
    /// # Errors
    ///
    /// Fails if the poll is rejected.
    pub async fn current_status(&self) -> Result<Value, ClientError> {
        self.send_action(Action::CurrentStatus).await
    }

    /// # Errors
    ///
    /// Fails if the action is rejected.
    pub async fn set_sync_settings(&self, params: Value) -> Result<(), ClientError> {
        self.send_action(Action::SetSyncSettings(params)).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the action is rejected.
    pub async fn shake(&self) -> Result<(), ClientError> {
        self.send_action(Action::Shake).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the action is rejected.
    pub async fn set_orientation(&self, orientation: &str) -> Result<(), ClientError> {
        self.send_action(Action::SetOrientation(orientation.to_string()))
            .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the action is rejected.
    pub async fn start_instruments_recording(
        &self,
        recording_path: &str,
        sampling_interval: Option<u64>,
    ) -> Result<(), ClientError> {
        self.send_action(Action::SetInstrumentsRecordingState {
            recording_path: Some(recording_path.to_string()),
            sampling_interval,
        })
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the action is rejected.
    pub async fn stop_instruments_recording(&self) -> Result<(), ClientError> {
        self.send_action(Action::SetInstrumentsRecordingState {
            recording_path: None,
            sampling_interval: None,
        })
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the action is rejected.
    pub async fn deliver_payload(&self, params: Value) -> Result<(), ClientError> {
        self.send_action(Action::DeliverPayload(params)).await?;
        Ok(())
    }
}
