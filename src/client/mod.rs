//! Client side of the hub protocol
//!
//! This module provides:
//! - `ReconnectingClient`: WebSocket connection with backoff and registration
//! - `Correlator`: turns a chat into one awaited reply by request id
//! - `UiClient`: the UI-role facade over both
//! - `WorkerClient`: runs a `Responder` behind the worker role

pub mod backoff;
pub mod connection;
pub mod correlator;
pub mod ui;
pub mod worker;

pub use backoff::{Backoff, BackoffPolicy};
pub use connection::{ClientEvent, ClientHandle, ClientOptions, ConnectionState, ReconnectingClient};
pub use correlator::{Correlator, CorrelatorError, Disposition, ResponseHandle};
pub use ui::UiClient;
pub use worker::{ChatRequest, EchoResponder, EmitError, Responder, ResponseEmitter, WorkerClient};

use crate::protocol::Envelope;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is shut down")]
    Closed,
    #[error("hub rejected registration: {0}")]
    RegistrationRejected(String),
    #[error("connection abandoned after {0} reconnect attempts")]
    Abandoned(u32),
}

/// Anything envelopes can be handed to for delivery to the hub
pub trait EnvelopeSink: Send + Sync {
    fn send_envelope(&self, envelope: Envelope) -> Result<(), ClientError>;
}

impl EnvelopeSink for mpsc::UnboundedSender<Envelope> {
    fn send_envelope(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.send(envelope).map_err(|_| ClientError::Closed)
    }
}

impl EnvelopeSink for ClientHandle {
    fn send_envelope(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.send(envelope)
    }
}
