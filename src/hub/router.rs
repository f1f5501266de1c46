//! Envelope dispatch: the hub's per-envelope decision logic
//!
//! `HubState` is plain synchronous state owned by the hub actor. Every
//! connection event goes through one of its `handle_*` methods, one at a
//! time, which is what makes registry and queue mutation serialized and
//! lets a worker registration flush the offline queue before any later
//! envelope is looked at.

use super::queue::{OfflineQueue, QueueOutcome};
use super::registry::{ConnectionId, ConnectionRegistry, ConnectionRole};
use super::{HubConfig, HubError, HubStats};
use crate::protocol::{ClientRole, Envelope, Message, StreamEvent, StreamTracker};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const REGISTER_INVITE: &str = "Connected to hub; send a register envelope with clientType 'ui' or 'worker'";

pub struct HubState {
    registry: ConnectionRegistry,
    queue: OfflineQueue,
    streams: StreamTracker,
    /// Worker connection that opened each active stream
    stream_owners: HashMap<String, ConnectionId>,
}

impl HubState {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            queue: OfflineQueue::new(config.queue_max_depth),
            streams: StreamTracker::new(config.stream_window),
            stream_owners: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            ui: self.registry.count(ConnectionRole::Registered(ClientRole::Ui)),
            worker: self
                .registry
                .count(ConnectionRole::Registered(ClientRole::Worker)),
            unregistered: self.registry.count(ConnectionRole::Unregistered),
            queue_depth: self.queue.depth(),
            active_streams: self.streams.active_count(),
        }
    }

    /// New socket: track it and invite registration
    pub fn handle_connect(&mut self, id: ConnectionId, sender: mpsc::UnboundedSender<Envelope>) {
        let handle = self.registry.add(id, sender);
        info!(connection_id = %id, total = self.registry.len(), "Connection opened");
        handle.send(Envelope::new(Message::Status {
            content: REGISTER_INVITE.to_string(),
            worker_online: None,
            queue_depth: None,
        }));
    }

    /// Socket closed. Safe to call more than once.
    pub fn handle_disconnect(&mut self, id: ConnectionId) {
        let Some(role) = self.registry.unregister(id) else {
            return;
        };
        info!(connection_id = %id, role = ?role, "Connection closed");

        if role != ConnectionRole::Registered(ClientRole::Worker) {
            return;
        }
        self.abandon_streams_of(id);
        if self.registry.by_role(ClientRole::Worker).is_empty() {
            info!("Last worker disconnected; chats will be queued");
            self.notify_worker_presence(false);
        }
    }

    /// Raw text frame from a connection
    pub fn handle_text(&mut self, id: ConnectionId, text: &str) {
        match parse_envelope(text) {
            Ok(envelope) => self.handle_envelope(id, envelope),
            Err(err) => {
                warn!(connection_id = %id, error = %err, "Dropping unparseable envelope");
                self.reply_error(id, &err, None);
            }
        }
    }

    /// Dispatch one parsed envelope
    pub fn handle_envelope(&mut self, id: ConnectionId, envelope: Envelope) {
        let Some(role) = self.registry.role_of(id) else {
            debug!(connection_id = %id, "Envelope from unknown connection ignored");
            return;
        };
        let kind = envelope.kind();

        match envelope.message {
            Message::Register { client_type } => self.on_register(id, client_type),
            Message::Ping => self.reply(id, Envelope::pong()),
            Message::Chat { .. } => match role {
                ConnectionRole::Registered(ClientRole::Ui) => self.on_chat(id, envelope),
                ConnectionRole::Registered(sender) => {
                    self.reject(id, HubError::UnauthorizedSender { role: sender, kind }, &envelope)
                }
                ConnectionRole::Unregistered => {
                    self.reject(id, HubError::NotRegistered(kind), &envelope)
                }
            },
            Message::ResponseStart { .. }
            | Message::ResponseChunk { .. }
            | Message::ResponseEnd { .. }
            | Message::Error { .. } => match role {
                ConnectionRole::Registered(ClientRole::Worker) => self.on_response(id, envelope),
                ConnectionRole::Registered(sender) => {
                    self.reject(id, HubError::UnauthorizedSender { role: sender, kind }, &envelope)
                }
                ConnectionRole::Unregistered => {
                    self.reject(id, HubError::NotRegistered(kind), &envelope)
                }
            },
            Message::Typing { .. } => match role.client_role() {
                Some(sender) => {
                    self.broadcast(sender.opposite(), &envelope);
                }
                None => self.reject(id, HubError::NotRegistered(kind), &envelope),
            },
            Message::Registered { .. } | Message::Status { .. } | Message::Pong => {
                let sender = role.client_role().unwrap_or(ClientRole::Ui);
                self.reject(id, HubError::UnauthorizedSender { role: sender, kind }, &envelope)
            }
        }
    }

    fn on_register(&mut self, id: ConnectionId, role: ClientRole) {
        let was_worker_online = !self.registry.by_role(ClientRole::Worker).is_empty();
        match self.registry.register(id, role) {
            Ok(ack) => {
                info!(connection_id = %id, role = %role, "Client registered");
                self.reply(id, ack);
                match role {
                    ClientRole::Worker => {
                        // Flush before anything else is dispatched
                        let workers = self.registry.by_role(ClientRole::Worker);
                        self.queue.flush(&workers);
                        if !was_worker_online {
                            self.notify_worker_presence(true);
                        }
                    }
                    ClientRole::Ui => {
                        let online = was_worker_online;
                        self.reply(
                            id,
                            Envelope::status(presence_text(online), online, self.queue.depth()),
                        );
                    }
                }
            }
            Err(err) => {
                warn!(connection_id = %id, error = %err, "Registration rejected");
                self.reply_error(id, &err, None);
            }
        }
    }

    fn on_chat(&mut self, id: ConnectionId, envelope: Envelope) {
        let Message::Chat {
            agent_id,
            request_id,
            ..
        } = &envelope.message
        else {
            return;
        };
        if request_id.trim().is_empty() {
            return self.reject(id, HubError::Malformed("chat requires a requestId".into()), &envelope);
        }
        if agent_id.trim().is_empty() {
            return self.reject(id, HubError::Malformed("chat requires an agentId".into()), &envelope);
        }

        let workers = self.registry.by_role(ClientRole::Worker);
        if let QueueOutcome::Rejected { depth } = self.queue.enqueue_or_route(envelope.clone(), &workers) {
            self.reject(id, HubError::QueueFull(depth), &envelope);
        }
    }

    fn on_response(&mut self, id: ConnectionId, envelope: Envelope) {
        if let Some((request_id, event)) = StreamEvent::from_message(&envelope.message) {
            if self.stream_owners.get(request_id).is_some_and(|owner| *owner != id) {
                warn!(
                    connection_id = %id,
                    request_id,
                    kind = envelope.kind(),
                    "Dropping response for a stream owned by another worker"
                );
                return;
            }
            match self.streams.observe(request_id, event) {
                Ok(state) if state.is_terminal() => {
                    self.stream_owners.remove(request_id);
                }
                Ok(_) => {
                    self.stream_owners.entry(request_id.to_string()).or_insert(id);
                }
                Err(err) => {
                    warn!(connection_id = %id, error = %err, "Dropping out-of-sequence response envelope");
                    return;
                }
            }
        }
        let delivered = self.broadcast(ClientRole::Ui, &envelope);
        debug!(
            kind = envelope.kind(),
            request_id = envelope.request_id().unwrap_or_default(),
            ui_clients = delivered,
            "Response relayed"
        );
    }

    /// Close every stream a departing worker left open and tell the UIs
    fn abandon_streams_of(&mut self, id: ConnectionId) {
        let mut orphaned: Vec<String> = self
            .stream_owners
            .iter()
            .filter(|(_, owner)| **owner == id)
            .map(|(request_id, _)| request_id.clone())
            .collect();
        orphaned.sort();

        for request_id in orphaned {
            self.stream_owners.remove(&request_id);
            self.streams.abandon(&request_id);
            warn!(connection_id = %id, request_id = %request_id, "Worker left mid-response; stream abandoned");
            let notice = Envelope::request_error(
                request_id.as_str(),
                "worker disconnected before finishing the response",
            );
            self.broadcast(ClientRole::Ui, &notice);
        }
    }

    fn notify_worker_presence(&self, online: bool) {
        let status = Envelope::status(presence_text(online), online, self.queue.depth());
        self.broadcast(ClientRole::Ui, &status);
    }

    fn broadcast(&self, role: ClientRole, envelope: &Envelope) -> usize {
        self.registry
            .by_role(role)
            .iter()
            .filter(|conn| conn.send(envelope.clone()))
            .count()
    }

    fn reply(&self, id: ConnectionId, envelope: Envelope) {
        if let Some(conn) = self.registry.get(id) {
            conn.send(envelope);
        }
    }

    fn reject(&self, id: ConnectionId, err: HubError, envelope: &Envelope) {
        warn!(connection_id = %id, kind = envelope.kind(), error = %err, "Envelope rejected");
        self.reply_error(id, &err, envelope.request_id().map(str::to_string));
    }

    fn reply_error(&self, id: ConnectionId, err: &HubError, request_id: Option<String>) {
        self.reply(id, err.to_envelope(request_id));
    }
}

fn presence_text(online: bool) -> &'static str {
    if online {
        "Worker online"
    } else {
        "Worker offline; chats will be queued"
    }
}

/// Parse a text frame, telling a bad `register` role apart from other
/// malformed input so the sender gets `invalid_role`.
fn parse_envelope(text: &str) -> Result<Envelope, HubError> {
    match Envelope::from_json(text) {
        Ok(envelope) => Ok(envelope),
        Err(err) => {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
                if value.get("type").and_then(|t| t.as_str()) == Some("register") {
                    let declared = value
                        .get("clientType")
                        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                        .unwrap_or_default();
                    return Err(HubError::InvalidRole(declared));
                }
            }
            Err(HubError::Malformed(err.to_string()))
        }
    }
}
