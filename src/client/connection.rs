//! Reconnecting WebSocket client for the hub protocol
//!
//! ```text
//! connect ──► send register ──► wait for registered ──► message loop
//!    ▲                                                      │
//!    └──── backoff sleep ◄──── connection lost ◄────────────┘
//! ```
//!
//! The attempt counter is reset only when the hub answers `registered`,
//! so a hub that accepts sockets but never registers them still exhausts
//! the attempt budget.

use super::backoff::{Backoff, BackoffPolicy};
use super::ClientError;
use crate::protocol::{ClientRole, Envelope, Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to wait for `registered` after sending `register`
const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle as observed by the owner of a [`ClientHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registered,
    Reconnecting { attempt: u32, delay: Duration },
    /// Shut down on request
    Closed,
    /// Gave up after exhausting the attempt budget
    Abandoned,
}

/// What the connection task reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The hub acknowledged our role; buffered outbound envelopes follow
    Registered,
    /// Any envelope received from the hub after `register` was sent
    Envelope(Envelope),
    /// A registered session ended unexpectedly
    Disconnected,
    /// Next attempt is scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// No further attempts will be made
    Abandoned { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub role: ClientRole,
    pub policy: BackoffPolicy,
    pub register_timeout: Duration,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>, role: ClientRole) -> Self {
        Self {
            url: url.into(),
            role,
            policy: BackoffPolicy::default(),
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_register_timeout(mut self, timeout: Duration) -> Self {
        self.register_timeout = timeout;
        self
    }
}

/// Cheap, cloneable handle to a running [`ReconnectingClient`]
#[derive(Debug, Clone)]
pub struct ClientHandle {
    outbound: mpsc::UnboundedSender<Envelope>,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
}

impl ClientHandle {
    /// Queue an envelope for the hub. While disconnected it is buffered and
    /// written, in order, after the next successful registration.
    pub fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Closed);
        }
        self.outbound.send(envelope).map_err(|_| ClientError::Closed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_registered(&self) -> bool {
        self.state() == ConnectionState::Registered
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Close the connection and disable further reconnect attempts
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// How a single connection attempt ended
enum SessionEnd {
    Shutdown,
    /// Lost before or after registration; `registered` tells which
    Lost { reason: String, registered: bool },
}

pub struct ReconnectingClient {
    options: ClientOptions,
    outbound: mpsc::UnboundedReceiver<Envelope>,
    /// Envelopes taken off `outbound` whose write failed
    unsent: VecDeque<Envelope>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl ReconnectingClient {
    /// Spawn a client with default options for `role`
    pub fn spawn(
        url: impl Into<String>,
        role: ClientRole,
        policy: BackoffPolicy,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        Self::spawn_with(ClientOptions::new(url, role).with_policy(policy))
    }

    pub fn spawn_with(options: ClientOptions) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let shutdown = CancellationToken::new();

        let client = ReconnectingClient {
            options,
            outbound: outbound_rx,
            unsent: VecDeque::new(),
            events: events_tx,
            state: state_tx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(client.run());

        let handle = ClientHandle {
            outbound: outbound_tx,
            state: state_rx,
            shutdown,
        };
        (handle, events_rx)
    }

    async fn run(mut self) {
        let mut backoff = Backoff::new(self.options.policy);
        let role = self.options.role;

        loop {
            self.state.send_replace(ConnectionState::Connecting);

            match self.session(&mut backoff).await {
                SessionEnd::Shutdown => {
                    info!(role = %role, "Client shut down");
                    self.state.send_replace(ConnectionState::Closed);
                    return;
                }
                SessionEnd::Lost { reason, registered } => {
                    warn!(role = %role, reason = %reason, "Connection to hub lost");
                    if registered {
                        self.emit(ClientEvent::Disconnected);
                    }
                }
            }

            let Some(delay) = backoff.next_delay() else {
                let attempts = backoff.attempts();
                warn!(role = %role, attempts, "Giving up on hub connection");
                self.state.send_replace(ConnectionState::Abandoned);
                self.emit(ClientEvent::Abandoned { attempts });
                return;
            };
            let attempt = backoff.attempts();
            info!(
                role = %role,
                attempt,
                max_attempts = backoff.policy().max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to hub"
            );
            self.state
                .send_replace(ConnectionState::Reconnecting { attempt, delay });
            self.emit(ClientEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => {
                    info!(role = %role, "Client shut down during reconnect backoff");
                    self.state.send_replace(ConnectionState::Closed);
                    return;
                }
            }
        }
    }

    /// One connection attempt, from connect to loss or shutdown
    async fn session(&mut self, backoff: &mut Backoff) -> SessionEnd {
        let url = self.options.url.clone();
        let connected = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
        };
        let ws = match connected {
            Ok((ws, _)) => ws,
            Err(e) => return lost(format!("connect to {url} failed: {e}"), false),
        };
        debug!(url = %url, "WebSocket connected, registering");

        let (mut write, mut read) = ws.split();

        if let Err(reason) = self.register(&mut write, &mut read).await {
            return match reason {
                None => SessionEnd::Shutdown,
                Some(reason) => lost(reason, false),
            };
        }

        backoff.reset();
        self.state.send_replace(ConnectionState::Registered);
        self.emit(ClientEvent::Registered);
        info!(role = %self.options.role, url = %url, "Registered with hub");

        if let Err(reason) = self.flush_unsent(&mut write).await {
            return lost(reason, true);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = write.send(tungstenite::Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }

                envelope = self.outbound.recv() => {
                    let Some(envelope) = envelope else {
                        // Every handle is gone: nobody can send or stop us
                        let _ = write.send(tungstenite::Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    };
                    if let Err(reason) = self.write_envelope(&mut write, envelope).await {
                        return lost(reason, true);
                    }
                }

                msg = read.next() => match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        return lost("closed by hub".into(), true);
                    }
                    Some(Err(e)) => return lost(format!("read error: {e}"), true),
                    // Pings are answered by tungstenite on the next write/flush
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    /// Send `register` and wait for the hub's `registered`.
    ///
    /// `Err(None)` means shutdown was requested, `Err(Some(reason))` that
    /// the attempt failed.
    async fn register<W, R>(&mut self, write: &mut W, read: &mut R) -> Result<(), Option<String>>
    where
        W: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
        R: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        let role = self.options.role;
        let register = Envelope::register(role)
            .to_json()
            .map_err(|e| Some(format!("failed to encode register: {e}")))?;
        write
            .send(tungstenite::Message::Text(register.into()))
            .await
            .map_err(|e| Some(format!("register send failed: {e}")))?;

        let deadline = tokio::time::sleep(self.options.register_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = write.send(tungstenite::Message::Close(None)).await;
                    return Err(None);
                }
                _ = &mut deadline => {
                    return Err(Some("timed out waiting for registered".into()));
                }
                msg = read.next() => match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        let envelope = match Envelope::from_json(text.as_str()) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!(error = %e, "Ignoring malformed envelope from hub");
                                continue;
                            }
                        };
                        match &envelope.message {
                            Message::Registered { client_type } if *client_type == role => return Ok(()),
                            Message::Registered { client_type } => {
                                return Err(Some(format!("hub registered us as {client_type}, expected {role}")));
                            }
                            Message::Error { content, request_id: None, .. } => {
                                let err = ClientError::RegistrationRejected(content.clone());
                                return Err(Some(err.to_string()));
                            }
                            _ => self.emit(ClientEvent::Envelope(envelope)),
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        return Err(Some("closed before registration".into()));
                    }
                    Some(Err(e)) => return Err(Some(format!("read error: {e}"))),
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    async fn flush_unsent<W>(&mut self, write: &mut W) -> Result<(), String>
    where
        W: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
    {
        if !self.unsent.is_empty() {
            debug!(count = self.unsent.len(), "Resending envelopes from previous session");
        }
        while let Some(envelope) = self.unsent.pop_front() {
            self.write_envelope(write, envelope).await?;
        }
        Ok(())
    }

    /// Write one envelope; on failure it is kept for the next session
    async fn write_envelope<W>(&mut self, write: &mut W, envelope: Envelope) -> Result<(), String>
    where
        W: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
    {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(kind = envelope.kind(), error = %e, "Dropping unserializable envelope");
                return Ok(());
            }
        };
        match write.send(tungstenite::Message::Text(json.into())).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.unsent.push_front(envelope);
                Err(format!("write failed: {e}"))
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match Envelope::from_json(text) {
            Ok(envelope) => self.emit(ClientEvent::Envelope(envelope)),
            Err(e) => warn!(error = %e, "Ignoring malformed envelope from hub"),
        }
    }

    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

fn lost(reason: String, registered: bool) -> SessionEnd {
    SessionEnd::Lost { reason, registered }
}
