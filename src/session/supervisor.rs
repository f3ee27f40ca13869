//! Connection supervisor for the single messaging session.
//!
//! ```text
//!             connect ok + Open event
//! connecting ───────────────────────────► open
//!     ▲                                    │
//!     │ backoff delay                      │ Closed(reason)
//!     │ (reason recoverable)               ▼
//!     └────────────────────────────────── closed ──► stop (LoggedOut / retries exhausted)
//! ```
//!
//! The active link is swapped under a write lock only on open and close, so
//! a concurrent `send` sees either the previous working link or the new one.
//! Credential updates are saved before the next link event is read.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};

use crate::commands::ReplySink;
use crate::error::{SendError, SessionError};
use crate::pairing::Identity;
use crate::pairing::identity::USER_ADDRESS_SUFFIX;
use crate::session::backoff::ReconnectPolicy;
use crate::session::storage::CredentialStorage;
use crate::session::transport::{
    Connector, Credentials, DisconnectReason, LinkEvent, OutgoingMessage, RawMessage, SessionLink,
};

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Operator-facing events published by the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StateChanged(ConnectionState),
    Disconnected(DisconnectReason),
    CredentialsPersisted,
    PersistFailed(String),
    /// Consecutive reconnect failures crossed the alert threshold.
    ReconnectFailing { failures: u32, last_error: String },
    /// The supervisor stopped for good and needs an operator.
    Fatal(String),
}

/// A text message from a remote user, ready for command dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundText {
    pub from: Identity,
    pub text: String,
}

/// Timeouts applied by the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Upper bound on a single outbound send.
    pub send_timeout: Duration,
    /// How long to wait for room in the inbound queue before dropping.
    pub inbound_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(15),
            inbound_timeout: Duration::from_secs(5),
        }
    }
}

/// How a single session attempt ended.
enum SessionOutcome {
    Shutdown,
    LoggedOut,
    Disconnected {
        reason: DisconnectReason,
        was_open: bool,
    },
    Failed(String),
}

/// Owns the one long-lived session to the messaging network.
pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    storage: Arc<dyn CredentialStorage>,
    policy: ReconnectPolicy,
    options: SupervisorOptions,
    inbound: mpsc::Sender<InboundText>,
    link: RwLock<Option<Arc<dyn SessionLink>>>,
    send_lock: Mutex<()>,
    self_identity: RwLock<Option<Identity>>,
    last_disconnect: RwLock<Option<DisconnectReason>>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SupervisorEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        storage: Arc<dyn CredentialStorage>,
        policy: ReconnectPolicy,
        options: SupervisorOptions,
        inbound: mpsc::Sender<InboundText>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (events, _) = broadcast::channel(64);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            connector,
            storage,
            policy,
            options,
            inbound,
            link: RwLock::new(None),
            send_lock: Mutex::new(()),
            self_identity: RwLock::new(None),
            last_disconnect: RwLock::new(None),
            state_tx,
            events,
            shutdown_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub async fn last_disconnect(&self) -> Option<DisconnectReason> {
        *self.last_disconnect.read().await
    }

    /// Ask `run` to close the session and return.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Keep the session alive until logout, retry exhaustion or shutdown.
    pub async fn run(&self) -> Result<(), SessionError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow_and_update() {
                self.set_state(ConnectionState::Closed);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);

            let last_error = match self.run_session(&mut shutdown).await {
                SessionOutcome::Shutdown => {
                    self.set_state(ConnectionState::Closed);
                    tracing::info!("Session supervisor shut down");
                    return Ok(());
                }
                SessionOutcome::LoggedOut => {
                    self.set_state(ConnectionState::Closed);
                    self.fatal("Session logged out; scan a new QR code or re-link the device");
                    return Err(SessionError::LoggedOut);
                }
                SessionOutcome::Disconnected { reason, was_open } => {
                    if was_open {
                        failures = 0;
                    }
                    reason.to_string()
                }
                SessionOutcome::Failed(error) => error,
            };

            failures = failures.saturating_add(1);

            if self.policy.is_exhausted(failures) {
                self.set_state(ConnectionState::Closed);
                self.fatal(&format!(
                    "Gave up reconnecting after {failures} attempts: {last_error}"
                ));
                return Err(SessionError::RetriesExhausted { attempts: failures });
            }

            let delay = self.policy.delay_for(failures - 1);
            if self.policy.should_alert(failures) {
                tracing::error!(
                    failures,
                    error = %last_error,
                    delay_ms = delay.as_millis() as u64,
                    "Session keeps failing, still reconnecting"
                );
                self.emit(SupervisorEvent::ReconnectFailing {
                    failures,
                    last_error,
                });
            } else {
                tracing::warn!(
                    failures,
                    error = %last_error,
                    delay_ms = delay.as_millis() as u64,
                    "Session dropped, reconnecting"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Drive one session from connect to close.
    async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> SessionOutcome {
        let credentials = match self.storage.load().await {
            Ok(credentials) => credentials,
            Err(e) => return SessionOutcome::Failed(format!("credential load failed: {e}")),
        };
        tracing::info!(restored = credentials.is_some(), "Opening session");

        let (link, mut events) = match self.connector.connect(credentials).await {
            Ok(pair) => pair,
            Err(e) => return SessionOutcome::Failed(e.to_string()),
        };

        let mut was_open = false;
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.changed() => {
                    self.drop_link(&link).await;
                    return SessionOutcome::Shutdown;
                }
            };

            match event {
                Some(LinkEvent::Open { self_address }) => {
                    *self.self_identity.write().await =
                        self_address.and_then(|a| Identity::parse(&a).ok());
                    *self.link.write().await = Some(Arc::clone(&link));
                    was_open = true;
                    self.set_state(ConnectionState::Open);
                    tracing::info!("Session open");
                }
                Some(LinkEvent::CredentialsUpdated { credentials, ack }) => {
                    let persisted = self.persist(&credentials).await;
                    if let Some(ack) = ack {
                        let _ = ack.send(persisted);
                    }
                }
                Some(LinkEvent::Message(raw)) => self.forward(raw).await,
                Some(LinkEvent::Closed(reason)) => return self.on_closed(&link, reason, was_open).await,
                None => {
                    return self
                        .on_closed(&link, DisconnectReason::ConnectionLost, was_open)
                        .await;
                }
            }
        }
    }

    async fn on_closed(
        &self,
        link: &Arc<dyn SessionLink>,
        reason: DisconnectReason,
        was_open: bool,
    ) -> SessionOutcome {
        self.drop_link(link).await;
        *self.last_disconnect.write().await = Some(reason);
        self.set_state(ConnectionState::Closed);
        self.emit(SupervisorEvent::Disconnected(reason));
        tracing::info!(reason = %reason, "Session closed");

        if reason.is_recoverable() {
            SessionOutcome::Disconnected { reason, was_open }
        } else {
            SessionOutcome::LoggedOut
        }
    }

    async fn drop_link(&self, link: &Arc<dyn SessionLink>) {
        self.link.write().await.take();
        link.close().await;
    }

    async fn persist(&self, credentials: &Credentials) -> bool {
        match self.storage.save(credentials).await {
            Ok(()) => {
                self.emit(SupervisorEvent::CredentialsPersisted);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist session credentials");
                self.emit(SupervisorEvent::PersistFailed(e.to_string()));
                false
            }
        }
    }

    /// Filter and enqueue an inbound message for the dispatcher.
    ///
    /// Only phone-number addresses (`<digits>@s.whatsapp.net`) map to an
    /// [`Identity`] that pairing and replies can use. Group chats and `@lid`
    /// privacy addresses carry no phone number, so they are dropped.
    async fn forward(&self, raw: RawMessage) {
        if raw.from_me {
            return;
        }
        let Some(text) = raw.body.plain_text() else {
            tracing::trace!(address = %raw.remote_address, "Ignoring message without text");
            return;
        };
        if raw.remote_address.contains('@') && !raw.remote_address.ends_with(USER_ADDRESS_SUFFIX)
        {
            tracing::debug!(
                address = %raw.remote_address,
                "Ignoring message from an address without a phone number"
            );
            return;
        }
        let from = match Identity::parse(&raw.remote_address) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring message from unparseable sender");
                return;
            }
        };
        if self.self_identity.read().await.as_ref() == Some(&from) {
            return;
        }

        let inbound = InboundText {
            from,
            text: text.to_string(),
        };
        match self
            .inbound
            .send_timeout(inbound, self.options.inbound_timeout)
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(dropped)) => {
                tracing::warn!(from = %dropped.from, "Inbound queue full, dropping message");
            }
            Err(SendTimeoutError::Closed(_)) => {
                tracing::debug!("Inbound receiver gone, dropping message");
            }
        }
    }

    /// Send a message to `to` over the active session.
    ///
    /// Fails fast unless the session is open. Not retried.
    pub async fn send(&self, to: &Identity, message: &OutgoingMessage) -> Result<(), SendError> {
        let _serialized = self.send_lock.lock().await;

        let link = match (self.state(), self.link.read().await.clone()) {
            (ConnectionState::Open, Some(link)) => link,
            _ => return Err(SendError::NotConnected),
        };

        let timeout = self.options.send_timeout;
        match tokio::time::timeout(timeout, link.send(&to.to_address(), message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(to = %to, error = %e, "Send failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(to = %to, ?timeout, "Send timed out");
                Err(SendError::Timeout { timeout })
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::debug!(state = %state, "Session state changed");
            self.emit(SupervisorEvent::StateChanged(state));
        }
    }

    fn fatal(&self, message: &str) {
        tracing::error!(reason = %message, "Session supervisor stopped");
        self.emit(SupervisorEvent::Fatal(message.to_string()));
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ReplySink for ConnectionSupervisor {
    async fn send_reply(&self, to: &Identity, message: &OutgoingMessage) -> Result<(), SendError> {
        self.send(to, message).await
    }
}
