//! Request correlation: one `chat` out, one resolved reply back
//!
//! Each request gets a fresh id, a pending entry with an empty chunk
//! accumulator, and a deadline timer. Response envelopes are matched by
//! request id and driven through the stream state machine; the entry is
//! settled exactly once by `response_end`, `error`, deadline expiry or
//! `fail_all`.

use super::{ClientError, EnvelopeSink};
use crate::protocol::{Envelope, Message, StreamEvent, StreamTracker, DEFAULT_STREAM_WINDOW};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default time a request may stay unanswered
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelatorError {
    #[error("no response for request {request_id} within {timeout:?}")]
    Timeout { request_id: String, timeout: Duration },
    #[error("request {request_id} failed: {message}")]
    Remote { request_id: String, message: String },
    #[error("request id {0} is already in use")]
    DuplicateRequestId(String),
    #[error("request {request_id} abandoned: {reason}")]
    ConnectionAbandoned { request_id: String, reason: String },
    #[error("could not send request: {0}")]
    Send(String),
    #[error("request was dropped before it settled")]
    Dropped,
}

impl CorrelatorError {
    /// True for failures the UI should present as a generic "no response"
    pub fn is_no_response(&self) -> bool {
        matches!(
            self,
            CorrelatorError::Timeout { .. }
                | CorrelatorError::ConnectionAbandoned { .. }
                | CorrelatorError::Dropped
        )
    }
}

impl From<ClientError> for CorrelatorError {
    fn from(err: ClientError) -> Self {
        CorrelatorError::Send(err.to_string())
    }
}

/// What `handle_envelope` did with an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// `response_start` or `response_chunk` for a pending request
    Accepted,
    /// `response_end` settled a pending request
    Resolved,
    /// `error` settled a pending request
    Rejected,
    /// Not a response, unknown or finished id, or out of sequence
    Ignored,
}

type Reply = Result<String, CorrelatorError>;

struct PendingRequest {
    agent_id: String,
    chunks: Vec<String>,
    created_at: Instant,
    responder: oneshot::Sender<Reply>,
    timer: JoinHandle<()>,
}

impl PendingRequest {
    fn settle(self, reply: Reply) {
        self.timer.abort();
        // The caller may have stopped waiting
        let _ = self.responder.send(reply);
    }
}

struct Inner {
    pending: HashMap<String, PendingRequest>,
    streams: StreamTracker,
}

/// Awaitable result of one request
#[derive(Debug)]
pub struct ResponseHandle {
    request_id: String,
    reply: oneshot::Receiver<Reply>,
}

impl ResponseHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the request to settle
    pub async fn wait(self) -> Result<String, CorrelatorError> {
        self.reply.await.unwrap_or(Err(CorrelatorError::Dropped))
    }
}

/// Tracks in-flight requests sent through `sink`
///
/// # Example
///
/// ```rust
/// use coach_broker::client::Correlator;
/// use coach_broker::protocol::Envelope;
/// use tokio::sync::mpsc;
///
/// # tokio_test::block_on(async {
/// let (tx, mut outbound) = mpsc::unbounded_channel();
/// let correlator = Correlator::new(tx);
///
/// let handle = correlator.send_with_id("r1", "coach", "hi").await.unwrap();
/// assert!(outbound.recv().await.is_some());
///
/// correlator.handle_envelope(&Envelope::response_start("coach", "r1")).await;
/// correlator.handle_envelope(&Envelope::response_chunk("coach", "r1", "Hel")).await;
/// correlator.handle_envelope(&Envelope::response_chunk("coach", "r1", "lo")).await;
/// correlator.handle_envelope(&Envelope::response_end("coach", "r1", "")).await;
///
/// assert_eq!(handle.wait().await.unwrap(), "Hello");
/// # });
/// ```
pub struct Correlator<S> {
    inner: Arc<Mutex<Inner>>,
    sink: S,
    timeout: Duration,
}

impl<S: Clone> Clone for Correlator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            sink: self.sink.clone(),
            timeout: self.timeout,
        }
    }
}

impl<S: EnvelopeSink> Correlator<S> {
    pub fn new(sink: S) -> Self {
        Self::with_timeout(sink, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(sink: S, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pending: HashMap::new(),
                streams: StreamTracker::new(DEFAULT_STREAM_WINDOW),
            })),
            sink,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a chat under a fresh request id
    pub async fn send(
        &self,
        agent_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<ResponseHandle, CorrelatorError> {
        self.send_with_id(Uuid::new_v4().to_string(), agent_id, content)
            .await
    }

    /// Send a chat under a caller-chosen request id. Ids that are pending
    /// or recently finished are refused.
    pub async fn send_with_id(
        &self,
        request_id: impl Into<String>,
        agent_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<ResponseHandle, CorrelatorError> {
        let request_id = request_id.into();
        let agent_id = agent_id.into();

        let mut inner = self.inner.lock().await;
        if inner.pending.contains_key(&request_id) || inner.streams.is_known(&request_id) {
            return Err(CorrelatorError::DuplicateRequestId(request_id));
        }

        let (responder, reply) = oneshot::channel();
        let created_at = Instant::now();
        let timer = spawn_deadline(
            Arc::downgrade(&self.inner),
            request_id.clone(),
            created_at + self.timeout,
            self.timeout,
        );
        inner.pending.insert(
            request_id.clone(),
            PendingRequest {
                agent_id: agent_id.clone(),
                chunks: Vec::new(),
                created_at,
                responder,
                timer,
            },
        );

        // Sent under the lock so a fast reply always finds its entry
        let chat = Envelope::chat(agent_id.as_str(), content, request_id.as_str());
        if let Err(e) = self.sink.send_envelope(chat) {
            if let Some(pending) = inner.pending.remove(&request_id) {
                pending.timer.abort();
            }
            return Err(e.into());
        }
        debug!(request_id = %request_id, agent_id = %agent_id, "Chat sent");

        Ok(ResponseHandle { request_id, reply })
    }

    /// Feed one inbound envelope
    pub async fn handle_envelope(&self, envelope: &Envelope) -> Disposition {
        let Some((request_id, event)) = StreamEvent::from_message(&envelope.message) else {
            return Disposition::Ignored;
        };

        let mut inner = self.inner.lock().await;
        if !inner.pending.contains_key(request_id) {
            debug!(request_id, kind = envelope.kind(), "Response for unknown or finished request ignored");
            return Disposition::Ignored;
        }
        if let Err(e) = inner.streams.observe(request_id, event) {
            warn!(error = %e, "Ignoring out-of-sequence response");
            return Disposition::Ignored;
        }

        match &envelope.message {
            Message::ResponseStart { .. } => Disposition::Accepted,
            Message::ResponseChunk { content, .. } => {
                if let Some(pending) = inner.pending.get_mut(request_id) {
                    pending.chunks.push(content.clone());
                }
                Disposition::Accepted
            }
            Message::ResponseEnd { full_content, .. } => {
                let Some(pending) = inner.pending.remove(request_id) else {
                    return Disposition::Ignored;
                };
                let text = if full_content.is_empty() {
                    pending.chunks.concat()
                } else {
                    full_content.clone()
                };
                debug!(
                    request_id,
                    agent_id = %pending.agent_id,
                    chunks = pending.chunks.len(),
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    "Request resolved"
                );
                pending.settle(Ok(text));
                Disposition::Resolved
            }
            Message::Error { content, .. } => {
                let Some(pending) = inner.pending.remove(request_id) else {
                    return Disposition::Ignored;
                };
                debug!(request_id, error = %content, "Request rejected by worker");
                pending.settle(Err(CorrelatorError::Remote {
                    request_id: request_id.to_string(),
                    message: content.clone(),
                }));
                Disposition::Rejected
            }
            _ => Disposition::Ignored,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn is_pending(&self, request_id: &str) -> bool {
        self.inner.lock().await.pending.contains_key(request_id)
    }

    /// Reject every pending request (the connection is gone for good).
    /// Returns how many were rejected.
    pub async fn fail_all(&self, reason: &str) -> usize {
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> = inner.pending.keys().cloned().collect();
        for request_id in &ids {
            inner.streams.abandon(request_id);
            if let Some(pending) = inner.pending.remove(request_id) {
                pending.settle(Err(CorrelatorError::ConnectionAbandoned {
                    request_id: request_id.clone(),
                    reason: reason.to_string(),
                }));
            }
        }
        if !ids.is_empty() {
            warn!(count = ids.len(), reason, "Pending requests abandoned");
        }
        ids.len()
    }
}

fn spawn_deadline(
    inner: Weak<Mutex<Inner>>,
    request_id: String,
    deadline: Instant,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock().await;
        if let Some(pending) = inner.pending.remove(&request_id) {
            // Late envelopes for this id are now duplicates
            inner.streams.abandon(&request_id);
            warn!(request_id = %request_id, timeout_secs = timeout.as_secs(), "Request timed out");
            let _ = pending.responder.send(Err(CorrelatorError::Timeout {
                request_id,
                timeout,
            }));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn correlator() -> (
        Correlator<mpsc::UnboundedSender<Envelope>>,
        mpsc::UnboundedReceiver<Envelope>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Correlator::new(tx), rx)
    }

    #[tokio::test]
    async fn test_send_emits_chat_with_fresh_id() {
        let (correlator, mut outbound) = correlator();
        let first = correlator.send("coach", "hi").await.unwrap();
        let second = correlator.send("coach", "hi").await.unwrap();
        assert_ne!(first.request_id(), second.request_id());

        let chat = outbound.recv().await.unwrap();
        assert_eq!(chat.kind(), "chat");
        assert_eq!(chat.request_id(), Some(first.request_id()));
        assert_eq!(correlator.pending_count().await, 2);
    }

    #[tokio::test]
    async fn test_chunks_then_end_prefers_full_content() {
        let (correlator, _outbound) = correlator();
        let handle = correlator.send_with_id("r1", "coach", "hi").await.unwrap();

        for env in [
            Envelope::response_start("coach", "r1"),
            Envelope::response_chunk("coach", "r1", "Hel"),
            Envelope::response_chunk("coach", "r1", "lo"),
        ] {
            assert_eq!(correlator.handle_envelope(&env).await, Disposition::Accepted);
        }
        let end = Envelope::response_end("coach", "r1", "Hello!");
        assert_eq!(correlator.handle_envelope(&end).await, Disposition::Resolved);

        assert_eq!(handle.wait().await.unwrap(), "Hello!");
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_full_content_falls_back_to_chunks() {
        let (correlator, _outbound) = correlator();
        let handle = correlator.send_with_id("r1", "coach", "hi").await.unwrap();
        correlator.handle_envelope(&Envelope::response_start("coach", "r1")).await;
        correlator.handle_envelope(&Envelope::response_chunk("coach", "r1", "Hel")).await;
        correlator.handle_envelope(&Envelope::response_chunk("coach", "r1", "lo")).await;
        correlator.handle_envelope(&Envelope::response_end("coach", "r1", "")).await;
        assert_eq!(handle.wait().await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn test_settles_exactly_once() {
        let (correlator, _outbound) = correlator();
        let handle = correlator.send_with_id("r1", "coach", "hi").await.unwrap();
        correlator.handle_envelope(&Envelope::response_start("coach", "r1")).await;
        correlator.handle_envelope(&Envelope::response_end("coach", "r1", "one")).await;

        let again = Envelope::response_end("coach", "r1", "two");
        assert_eq!(correlator.handle_envelope(&again).await, Disposition::Ignored);
        let late_error = Envelope::request_error("r1", "boom");
        assert_eq!(correlator.handle_envelope(&late_error).await, Disposition::Ignored);

        assert_eq!(handle.wait().await.unwrap(), "one");
    }

    #[tokio::test]
    async fn test_error_rejects_with_message() {
        let (correlator, _outbound) = correlator();
        let handle = correlator.send_with_id("r1", "coach", "hi").await.unwrap();
        correlator.handle_envelope(&Envelope::response_start("coach", "r1")).await;
        let disposition = correlator
            .handle_envelope(&Envelope::request_error("r1", "model crashed"))
            .await;
        assert_eq!(disposition, Disposition::Rejected);

        let err = handle.wait().await.unwrap_err();
        assert_eq!(
            err,
            CorrelatorError::Remote {
                request_id: "r1".into(),
                message: "model crashed".into()
            }
        );
        assert!(!err.is_no_response());
    }

    #[tokio::test]
    async fn test_overlapping_requests_resolve_independently() {
        let (correlator, _outbound) = correlator();
        let a = correlator.send_with_id("a", "coach", "one").await.unwrap();
        let b = correlator.send_with_id("b", "coach", "two").await.unwrap();

        for env in [
            Envelope::response_start("coach", "a"),
            Envelope::response_start("coach", "b"),
            Envelope::response_chunk("coach", "b", "B"),
            Envelope::response_chunk("coach", "a", "A"),
            Envelope::response_end("coach", "b", ""),
            Envelope::response_end("coach", "a", ""),
        ] {
            correlator.handle_envelope(&env).await;
        }
        assert_eq!(a.wait().await.unwrap(), "A");
        assert_eq!(b.wait().await.unwrap(), "B");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_envelopes_are_ignored() {
        let (correlator, _outbound) = correlator();
        let handle = correlator.send_with_id("r2", "coach", "hi").await.unwrap();
        correlator.handle_envelope(&Envelope::response_start("coach", "r2")).await;

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(correlator.is_pending("r2").await);

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, CorrelatorError::Timeout { ref request_id, .. } if request_id == "r2"));
        assert!(err.is_no_response());

        let late = Envelope::response_chunk("coach", "r2", "late");
        assert_eq!(correlator.handle_envelope(&late).await, Disposition::Ignored);
        let late_end = Envelope::response_end("coach", "r2", "late");
        assert_eq!(correlator.handle_envelope(&late_end).await, Disposition::Ignored);
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_request_is_not_timed_out() {
        let (correlator, _outbound) = correlator();
        let handle = correlator.send_with_id("r1", "coach", "hi").await.unwrap();
        correlator.handle_envelope(&Envelope::response_start("coach", "r1")).await;
        correlator.handle_envelope(&Envelope::response_end("coach", "r1", "done")).await;

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(handle.wait().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_duplicate_request_id_refused() {
        let (correlator, mut outbound) = correlator();
        let _handle = correlator.send_with_id("r1", "coach", "hi").await.unwrap();
        outbound.recv().await.unwrap();

        let err = correlator.send_with_id("r1", "coach", "again").await.unwrap_err();
        assert_eq!(err, CorrelatorError::DuplicateRequestId("r1".into()));
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_out_of_sequence_is_ignored() {
        let (correlator, _outbound) = correlator();
        let _handle = correlator.send_with_id("r1", "coach", "hi").await.unwrap();
        let chunk = Envelope::response_chunk("coach", "r1", "early");
        assert_eq!(correlator.handle_envelope(&chunk).await, Disposition::Ignored);
        assert!(correlator.is_pending("r1").await);
    }

    #[tokio::test]
    async fn test_non_response_envelopes_are_ignored() {
        let (correlator, _outbound) = correlator();
        assert_eq!(
            correlator.handle_envelope(&Envelope::typing(true, None)).await,
            Disposition::Ignored
        );
        assert_eq!(
            correlator
                .handle_envelope(&Envelope::response_start("coach", "never-sent"))
                .await,
            Disposition::Ignored
        );
    }

    #[tokio::test]
    async fn test_fail_all_rejects_everything_pending() {
        let (correlator, _outbound) = correlator();
        let a = correlator.send("coach", "one").await.unwrap();
        let b = correlator.send("coach", "two").await.unwrap();

        assert_eq!(correlator.fail_all("hub unreachable").await, 2);
        assert!(matches!(
            a.wait().await,
            Err(CorrelatorError::ConnectionAbandoned { .. })
        ));
        assert!(b.wait().await.unwrap_err().is_no_response());
        assert_eq!(correlator.fail_all("again").await, 0);
    }

    #[tokio::test]
    async fn test_send_failure_leaves_nothing_pending() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let correlator = Correlator::new(tx);
        let err = correlator.send("coach", "hi").await.unwrap_err();
        assert!(matches!(err, CorrelatorError::Send(_)));
        assert_eq!(correlator.pending_count().await, 0);
    }
}
