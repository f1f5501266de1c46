//! Connection registry: which socket holds which role

use super::HubError;
use crate::protocol::{ClientRole, Envelope};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Opaque id assigned to a connection when it is accepted
pub type ConnectionId = Uuid;

/// Role of a connection; write-once after leaving `Unregistered`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Unregistered,
    Registered(ClientRole),
}

impl ConnectionRole {
    pub fn client_role(self) -> Option<ClientRole> {
        match self {
            ConnectionRole::Unregistered => None,
            ConnectionRole::Registered(role) => Some(role),
        }
    }
}

/// A live connection as seen by the hub
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub role: ConnectionRole,
    pub opened_at: DateTime<Utc>,
    sender: mpsc::UnboundedSender<Envelope>,
}

impl ConnectionHandle {
    /// Queue an envelope for this connection's writer.
    ///
    /// Returns false if the connection's writer is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.sender.send(envelope).is_ok()
    }
}

/// Authoritative connection → role and role → connections mapping
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Registration order per role, so fan-out is deterministic
    members: HashMap<ConnectionRole, Vec<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection as `Unregistered`
    pub fn add(&mut self, id: ConnectionId, sender: mpsc::UnboundedSender<Envelope>) -> ConnectionHandle {
        let handle = ConnectionHandle {
            id,
            role: ConnectionRole::Unregistered,
            opened_at: Utc::now(),
            sender,
        };
        self.connections.insert(id, handle.clone());
        self.members
            .entry(ConnectionRole::Unregistered)
            .or_default()
            .push(id);
        handle
    }

    /// Move a connection into the declared role's set.
    ///
    /// Returns the `registered` acknowledgement to send back.
    pub fn register(&mut self, id: ConnectionId, role: ClientRole) -> Result<Envelope, HubError> {
        let handle = self
            .connections
            .get_mut(&id)
            .ok_or(HubError::UnknownConnection(id))?;

        if let ConnectionRole::Registered(existing) = handle.role {
            return Err(HubError::AlreadyRegistered(existing));
        }

        handle.role = ConnectionRole::Registered(role);
        Self::remove_member(&mut self.members, ConnectionRole::Unregistered, id);
        self.members
            .entry(ConnectionRole::Registered(role))
            .or_default()
            .push(id);

        debug!(connection_id = %id, role = %role, "Connection registered");
        Ok(Envelope::registered(role))
    }

    /// Forget a connection. Idempotent: returns the role it held, or `None`
    /// if it was already gone.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<ConnectionRole> {
        let handle = self.connections.remove(&id)?;
        Self::remove_member(&mut self.members, handle.role, id);
        Some(handle.role)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.connections.get(&id)
    }

    pub fn role_of(&self, id: ConnectionId) -> Option<ConnectionRole> {
        self.connections.get(&id).map(|c| c.role)
    }

    /// Live connections holding `role`, in registration order
    pub fn by_role(&self, role: ClientRole) -> Vec<ConnectionHandle> {
        self.members
            .get(&ConnectionRole::Registered(role))
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self, role: ConnectionRole) -> usize {
        self.members.get(&role).map(Vec::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn remove_member(
        members: &mut HashMap<ConnectionRole, Vec<ConnectionId>>,
        role: ConnectionRole,
        id: ConnectionId,
    ) {
        if let Some(ids) = members.get_mut(&role) {
            ids.retain(|member| *member != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    fn add_connection(registry: &mut ConnectionRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        registry.add(id, tx);
        (id, rx)
    }

    #[test]
    fn test_new_connection_is_unregistered() {
        let mut registry = ConnectionRegistry::new();
        let (id, _rx) = add_connection(&mut registry);
        assert_eq!(registry.role_of(id), Some(ConnectionRole::Unregistered));
        assert_eq!(registry.count(ConnectionRole::Unregistered), 1);
        assert!(registry.by_role(ClientRole::Ui).is_empty());
    }

    #[test]
    fn test_register_returns_ack_and_moves_sets() {
        let mut registry = ConnectionRegistry::new();
        let (id, _rx) = add_connection(&mut registry);

        let ack = registry.register(id, ClientRole::Worker).unwrap();
        assert_eq!(
            ack.message,
            Message::Registered {
                client_type: ClientRole::Worker
            }
        );
        assert_eq!(registry.count(ConnectionRole::Unregistered), 0);
        assert_eq!(registry.by_role(ClientRole::Worker).len(), 1);
        assert_eq!(registry.by_role(ClientRole::Worker)[0].id, id);
    }

    #[test]
    fn test_role_is_write_once() {
        let mut registry = ConnectionRegistry::new();
        let (id, _rx) = add_connection(&mut registry);
        registry.register(id, ClientRole::Ui).unwrap();

        let err = registry.register(id, ClientRole::Worker).unwrap_err();
        assert!(matches!(err, HubError::AlreadyRegistered(ClientRole::Ui)));
        assert_eq!(registry.role_of(id), Some(ConnectionRole::Registered(ClientRole::Ui)));
        assert!(registry.by_role(ClientRole::Worker).is_empty());
    }

    #[test]
    fn test_register_unknown_connection() {
        let mut registry = ConnectionRegistry::new();
        let err = registry.register(Uuid::new_v4(), ClientRole::Ui).unwrap_err();
        assert!(matches!(err, HubError::UnknownConnection(_)));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut registry = ConnectionRegistry::new();
        let (id, _rx) = add_connection(&mut registry);
        let (other, _rx2) = add_connection(&mut registry);
        registry.register(id, ClientRole::Ui).unwrap();
        registry.register(other, ClientRole::Ui).unwrap();

        assert_eq!(
            registry.unregister(id),
            Some(ConnectionRole::Registered(ClientRole::Ui))
        );
        let after_first: Vec<_> = registry.by_role(ClientRole::Ui).iter().map(|c| c.id).collect();

        assert_eq!(registry.unregister(id), None);
        let after_second: Vec<_> = registry.by_role(ClientRole::Ui).iter().map(|c| c.id).collect();

        assert_eq!(after_first, vec![other]);
        assert_eq!(after_first, after_second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_by_role_keeps_registration_order() {
        let mut registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (id, rx) = add_connection(&mut registry);
            registry.register(id, ClientRole::Ui).unwrap();
            receivers.push(rx);
            ids.push(id);
        }
        let fanout: Vec<_> = registry.by_role(ClientRole::Ui).iter().map(|c| c.id).collect();
        assert_eq!(fanout, ids);
    }

    #[test]
    fn test_send_reports_closed_writer() {
        let mut registry = ConnectionRegistry::new();
        let (id, rx) = add_connection(&mut registry);
        drop(rx);
        assert!(!registry.get(id).unwrap().send(Envelope::ping()));
    }
}
