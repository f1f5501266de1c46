//! UI-role client: chat in, resolved reply out

use super::connection::{ClientEvent, ClientHandle, ClientOptions, ConnectionState, ReconnectingClient};
use super::correlator::{Correlator, CorrelatorError, ResponseHandle};
use super::{BackoffPolicy, ClientError};
use crate::protocol::{ClientRole, Envelope, Message};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Broadcast capacity for envelope subscribers
const ENVELOPE_CAPACITY: usize = 1024;

/// A UI client connected (or reconnecting) to the hub.
///
/// A background pump feeds every inbound envelope to the correlator and
/// republishes it to subscribers, so a UI can render chunks as they arrive
/// while `chat()` waits for the final text.
pub struct UiClient {
    handle: ClientHandle,
    correlator: Correlator<ClientHandle>,
    envelopes: broadcast::Sender<Envelope>,
    worker_online: watch::Receiver<Option<bool>>,
    policy: BackoffPolicy,
    pump: JoinHandle<()>,
}

impl UiClient {
    pub fn connect(url: impl Into<String>, policy: BackoffPolicy, request_timeout: Duration) -> Self {
        Self::connect_with(ClientOptions::new(url, ClientRole::Ui).with_policy(policy), request_timeout)
    }

    pub fn connect_with(options: ClientOptions, request_timeout: Duration) -> Self {
        let policy = options.policy;
        let (handle, events) = ReconnectingClient::spawn_with(options);
        let correlator = Correlator::with_timeout(handle.clone(), request_timeout);
        let (envelopes, _) = broadcast::channel(ENVELOPE_CAPACITY);
        let (online_tx, worker_online) = watch::channel(None);

        let pump = tokio::spawn(pump(events, correlator.clone(), envelopes.clone(), online_tx));

        Self {
            handle,
            correlator,
            envelopes,
            worker_online,
            policy,
            pump,
        }
    }

    /// Send a chat and wait for the complete reply
    pub async fn chat(
        &self,
        agent_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<String, CorrelatorError> {
        self.send_chat(agent_id, content).await?.wait().await
    }

    /// Send a chat and return a handle to await later
    pub async fn send_chat(
        &self,
        agent_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<ResponseHandle, CorrelatorError> {
        self.correlator.send(agent_id, content).await
    }

    pub fn typing(&self, is_typing: bool, agent_id: Option<String>) -> Result<(), ClientError> {
        self.handle.send(Envelope::typing(is_typing, agent_id))
    }

    /// Every envelope received from the hub, in arrival order
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.envelopes.subscribe()
    }

    /// Last worker presence reported by the hub, if any
    pub fn worker_online(&self) -> Option<bool> {
        *self.worker_online.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn correlator(&self) -> &Correlator<ClientHandle> {
        &self.correlator
    }

    /// Resolve once registered, or fail if the client stops first
    pub async fn wait_registered(&self) -> Result<(), ClientError> {
        wait_registered(&self.handle, &self.policy).await
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}

impl Drop for UiClient {
    fn drop(&mut self) {
        self.handle.shutdown();
        self.pump.abort();
    }
}

pub(crate) async fn wait_registered(handle: &ClientHandle, policy: &BackoffPolicy) -> Result<(), ClientError> {
    let mut state = handle.subscribe_state();
    let reached = state
        .wait_for(|s| {
            matches!(
                s,
                ConnectionState::Registered | ConnectionState::Closed | ConnectionState::Abandoned
            )
        })
        .await
        .map(|s| *s);
    match reached {
        Ok(ConnectionState::Registered) => Ok(()),
        Ok(ConnectionState::Abandoned) => Err(ClientError::Abandoned(policy.max_attempts)),
        _ => Err(ClientError::Closed),
    }
}

async fn pump(
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    correlator: Correlator<ClientHandle>,
    envelopes: broadcast::Sender<Envelope>,
    worker_online: watch::Sender<Option<bool>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Envelope(envelope) => {
                let disposition = correlator.handle_envelope(&envelope).await;
                debug!(kind = envelope.kind(), ?disposition, "Envelope received");
                if let Message::Status {
                    worker_online: Some(online),
                    ..
                } = &envelope.message
                {
                    worker_online.send_replace(Some(*online));
                }
                // No subscribers is fine
                let _ = envelopes.send(envelope);
            }
            ClientEvent::Registered => info!("UI client registered"),
            ClientEvent::Disconnected => {
                // Presence is unknown until the hub tells us again
                worker_online.send_replace(None);
            }
            ClientEvent::Reconnecting { .. } => {}
            ClientEvent::Abandoned { attempts } => {
                correlator
                    .fail_all(&format!("hub unreachable after {attempts} attempts"))
                    .await;
            }
        }
    }
    correlator.fail_all("client stopped").await;
}
