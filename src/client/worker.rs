//! Worker-role runtime
//!
//! Turns a [`Responder`] ("content in, text out") into correctly sequenced
//! `response_start` → `response_chunk`* → `response_end` streams. Chats are
//! handled one at a time in arrival order.

use super::connection::{ClientEvent, ClientHandle, ClientOptions, ReconnectingClient};
use super::{BackoffPolicy, ClientError, EnvelopeSink};
use crate::protocol::{ClientRole, Envelope, Message, SequenceError, StreamEvent, StreamState};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A chat the hub delivered to this worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub agent_id: String,
    pub content: String,
    pub request_id: String,
}

impl ChatRequest {
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        match &envelope.message {
            Message::Chat {
                agent_id,
                content,
                request_id,
            } => Some(Self {
                agent_id: agent_id.clone(),
                content: content.clone(),
                request_id: request_id.clone(),
            }),
            _ => None,
        }
    }
}

/// Computes the reply to one chat
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, request: &ChatRequest, out: &mut ResponseEmitter) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Send(#[from] ClientError),
}

/// Emits one request's response stream, refusing illegal sequences
pub struct ResponseEmitter {
    sink: Arc<dyn EnvelopeSink>,
    agent_id: String,
    request_id: String,
    state: StreamState,
    chunks: Vec<String>,
}

impl ResponseEmitter {
    pub fn new(sink: Arc<dyn EnvelopeSink>, request: &ChatRequest) -> Self {
        Self {
            sink,
            agent_id: request.agent_id.clone(),
            request_id: request.request_id.clone(),
            state: StreamState::Idle,
            chunks: Vec::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn start(&mut self) -> Result<(), EmitError> {
        self.advance(StreamEvent::Start)?;
        let envelope = Envelope::response_start(self.agent_id.as_str(), self.request_id.as_str());
        self.sink.send_envelope(envelope)?;
        Ok(())
    }

    pub fn chunk(&mut self, content: impl Into<String>) -> Result<(), EmitError> {
        let content = content.into();
        self.advance(StreamEvent::Chunk)?;
        self.chunks.push(content.clone());
        let envelope = Envelope::response_chunk(self.agent_id.as_str(), self.request_id.as_str(), content);
        self.sink.send_envelope(envelope)?;
        Ok(())
    }

    /// Finish with the joined chunks as the full text
    pub fn end(&mut self) -> Result<(), EmitError> {
        let full = self.chunks.concat();
        self.end_with(full)
    }

    /// Finish with an explicit authoritative full text
    pub fn end_with(&mut self, full_content: impl Into<String>) -> Result<(), EmitError> {
        self.advance(StreamEvent::End)?;
        let envelope = Envelope::response_end(self.agent_id.as_str(), self.request_id.as_str(), full_content);
        self.sink.send_envelope(envelope)?;
        Ok(())
    }

    /// Abort the stream with an `error` envelope carrying the request id
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), EmitError> {
        self.advance(StreamEvent::Error)?;
        self.sink
            .send_envelope(Envelope::request_error(self.request_id.as_str(), message))?;
        Ok(())
    }

    fn advance(&mut self, event: StreamEvent) -> Result<(), SequenceError> {
        self.state = self.state.apply(&self.request_id, event)?;
        Ok(())
    }

    /// Close whatever the responder left open
    fn finish(&mut self, outcome: anyhow::Result<()>) -> Result<(), EmitError> {
        match outcome {
            Ok(()) if self.is_finished() => Ok(()),
            Ok(()) => {
                if self.state == StreamState::Idle {
                    self.start()?;
                }
                self.end()
            }
            Err(e) if self.is_finished() => {
                warn!(request_id = %self.request_id, error = %e, "Responder failed after finishing its stream");
                Ok(())
            }
            Err(e) => self.fail(format!("{e:#}")),
        }
    }
}

/// Replies with the chat content, split into chunks of `chunk_size` chars
#[derive(Debug, Clone)]
pub struct EchoResponder {
    pub chunk_size: usize,
}

impl Default for EchoResponder {
    fn default() -> Self {
        Self { chunk_size: 16 }
    }
}

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, request: &ChatRequest, out: &mut ResponseEmitter) -> anyhow::Result<()> {
        out.start()?;
        let chars: Vec<char> = request.content.chars().collect();
        for piece in chars.chunks(self.chunk_size.max(1)) {
            out.chunk(piece.iter().collect::<String>())?;
        }
        out.end_with(request.content.clone())?;
        Ok(())
    }
}

/// Worker connection driving a [`Responder`]
pub struct WorkerClient {
    handle: ClientHandle,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl WorkerClient {
    pub fn connect(url: impl Into<String>, policy: BackoffPolicy) -> Self {
        Self::connect_with(ClientOptions::new(url, ClientRole::Worker).with_policy(policy))
    }

    pub fn connect_with(options: ClientOptions) -> Self {
        let (handle, events) = ReconnectingClient::spawn_with(options);
        Self { handle, events }
    }

    /// Handle for shutting the worker down from elsewhere
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Serve chats until shut down (`Ok`) or abandoned (`Err`)
    pub async fn run<R: Responder>(mut self, responder: R) -> Result<(), ClientError> {
        let sink: Arc<dyn EnvelopeSink> = Arc::new(self.handle.clone());

        while let Some(event) = self.events.recv().await {
            match event {
                ClientEvent::Envelope(envelope) => {
                    if let Some(request) = ChatRequest::from_envelope(&envelope) {
                        handle_chat(&responder, sink.clone(), &request).await;
                    }
                }
                ClientEvent::Registered => info!("Worker registered, waiting for chats"),
                ClientEvent::Disconnected | ClientEvent::Reconnecting { .. } => {}
                ClientEvent::Abandoned { attempts } => return Err(ClientError::Abandoned(attempts)),
            }
        }
        Ok(())
    }
}

async fn handle_chat<R: Responder>(responder: &R, sink: Arc<dyn EnvelopeSink>, request: &ChatRequest) {
    debug!(request_id = %request.request_id, agent_id = %request.agent_id, "Chat received");
    let typing_agent = Some(request.agent_id.clone());
    let _ = sink.send_envelope(Envelope::typing(true, typing_agent.clone()));

    let mut emitter = ResponseEmitter::new(sink.clone(), request);
    let outcome = responder.respond(request, &mut emitter).await;
    if let Err(e) = emitter.finish(outcome) {
        warn!(request_id = %request.request_id, error = %e, "Could not complete response stream");
    }

    let _ = sink.send_envelope(Envelope::typing(false, typing_agent));
}
