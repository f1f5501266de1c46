//! Message hub between UI clients and the worker
//!
//! This module provides:
//! - `ConnectionRegistry`: connection ↔ role bookkeeping
//! - `OfflineQueue`: FIFO buffer for chats while no worker is connected
//! - `HubState`: synchronous envelope dispatch
//! - `Hub` / `HubHandle`: the actor task that owns all of the above

pub mod queue;
pub mod registry;
pub mod router;

pub use queue::{OfflineQueue, QueueOutcome};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionRole};
pub use router::HubState;

use crate::protocol::{ClientRole, Envelope, ErrorCode, DEFAULT_STREAM_WINDOW};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Hub tuning knobs (see `Config` for where they come from)
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum offline queue depth; `None` = unbounded
    pub queue_max_depth: Option<usize>,
    /// Finished request ids remembered for duplicate detection
    pub stream_window: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_max_depth: None,
            stream_window: DEFAULT_STREAM_WINDOW,
        }
    }
}

/// Errors raised while dispatching an envelope.
///
/// None of these are fatal to the hub: each is turned into an `error`
/// envelope for the offending sender (or just logged).
#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid role '{0}': expected 'ui' or 'worker'")]
    InvalidRole(String),
    #[error("connection already registered as {0}")]
    AlreadyRegistered(ClientRole),
    #[error("register before sending '{0}'")]
    NotRegistered(&'static str),
    #[error("{role} connections may not send '{kind}'")]
    UnauthorizedSender { role: ClientRole, kind: &'static str },
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("offline queue is full ({0} chats waiting for a worker)")]
    QueueFull(usize),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

impl HubError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::InvalidRole(_) => ErrorCode::InvalidRole,
            HubError::AlreadyRegistered(_) => ErrorCode::AlreadyRegistered,
            HubError::NotRegistered(_) | HubError::UnknownConnection(_) => ErrorCode::NotRegistered,
            HubError::UnauthorizedSender { .. } => ErrorCode::UnauthorizedSender,
            HubError::Malformed(_) => ErrorCode::MalformedEnvelope,
            HubError::QueueFull(_) => ErrorCode::QueueFull,
        }
    }

    /// Sender-directed `error` envelope describing this failure
    pub fn to_envelope(&self, request_id: Option<String>) -> Envelope {
        Envelope::error(self.code(), self.to_string(), request_id)
    }
}

/// Point-in-time hub counters (served by `/health`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub ui: usize,
    pub worker: usize,
    pub unregistered: usize,
    pub queue_depth: usize,
    pub active_streams: usize,
}

/// Commands accepted by the hub actor
#[derive(Debug)]
pub enum HubCommand {
    Connect {
        id: ConnectionId,
        sender: mpsc::UnboundedSender<Envelope>,
    },
    Inbound {
        id: ConnectionId,
        text: String,
    },
    Disconnect {
        id: ConnectionId,
    },
    Stats(oneshot::Sender<HubStats>),
}

/// The hub actor: one task owns `HubState` and processes commands in order
pub struct Hub {
    state: HubState,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Spawn the hub actor and return a handle to it
    pub fn start(config: HubConfig) -> HubHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let hub = Hub {
            state: HubState::new(&config),
            commands: rx,
            shutdown: shutdown.clone(),
        };
        info!(
            queue_max_depth = ?config.queue_max_depth,
            stream_window = config.stream_window,
            "Hub started"
        );
        tokio::spawn(hub.run());
        HubHandle {
            commands: tx,
            shutdown,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.dispatch(command);
                }
            }
        }
        info!(stats = ?self.state.stats(), "Hub stopped");
    }

    fn dispatch(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect { id, sender } => self.state.handle_connect(id, sender),
            HubCommand::Inbound { id, text } => self.state.handle_text(id, &text),
            HubCommand::Disconnect { id } => self.state.handle_disconnect(id),
            HubCommand::Stats(reply) => {
                let _ = reply.send(self.state.stats());
            }
        }
    }
}

/// Cheap, cloneable handle used by connection tasks to talk to the hub
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    shutdown: CancellationToken,
}

impl HubHandle {
    /// Register a new connection; returns its id and the stream of
    /// envelopes the hub wants written to it.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Envelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        if self.commands.send(HubCommand::Connect { id, sender }).is_err() {
            debug!(connection_id = %id, "Hub is stopped; connection will be closed");
        }
        (id, receiver)
    }

    /// Forward a raw text frame received on a connection
    pub fn inbound(&self, id: ConnectionId, text: impl Into<String>) {
        let _ = self.commands.send(HubCommand::Inbound {
            id,
            text: text.into(),
        });
    }

    pub fn disconnect(&self, id: ConnectionId) {
        let _ = self.commands.send(HubCommand::Disconnect { id });
    }

    /// Current counters, or `None` if the hub has stopped
    pub async fn stats(&self) -> Option<HubStats> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(HubCommand::Stats(tx)).ok()?;
        rx.await.ok()
    }

    /// Stop the actor. Connection receivers close, which ends their sockets.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled() || self.commands.is_closed()
    }
}
