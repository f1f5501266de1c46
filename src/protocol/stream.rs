//! Per-request response sequencing: start → chunk* → end (or error)
//!
//! The same transition function is used by the hub (validating what a worker
//! relays), by the correlator (consuming) and by the worker's emitter
//! (producing), so all three agree on what a legal stream is.

use super::types::Message;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;

/// Default number of finished request ids remembered for duplicate detection
pub const DEFAULT_STREAM_WINDOW: usize = 4096;

/// Lifecycle of one response stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Idle,
    Started,
    Streaming,
    Completed,
    Errored,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Completed | StreamState::Errored)
    }

    /// Pure transition function. `None` means the event is illegal here.
    pub fn next(self, event: StreamEvent) -> Option<StreamState> {
        use StreamEvent as E;
        use StreamState as S;
        match (self, event) {
            (S::Idle, E::Start) => Some(S::Started),
            (S::Started | S::Streaming, E::Chunk) => Some(S::Streaming),
            (S::Started | S::Streaming, E::End) => Some(S::Completed),
            (S::Idle | S::Started | S::Streaming, E::Error) => Some(S::Errored),
            _ => None,
        }
    }

    /// Transition or explain why not
    pub fn apply(self, request_id: &str, event: StreamEvent) -> Result<StreamState, SequenceError> {
        if self.is_terminal() {
            return Err(SequenceError::Duplicate {
                request_id: request_id.to_string(),
                state: self,
                event,
            });
        }
        self.next(event).ok_or_else(|| SequenceError::OutOfOrder {
            request_id: request_id.to_string(),
            state: self,
            event,
        })
    }
}

/// Response-side envelope kinds that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEvent {
    Start,
    Chunk,
    End,
    Error,
}

impl StreamEvent {
    /// Classify a message; non-response messages (and errors without a
    /// request id) return `None`.
    pub fn from_message(message: &Message) -> Option<(&str, StreamEvent)> {
        match message {
            Message::ResponseStart { request_id, .. } => Some((request_id, StreamEvent::Start)),
            Message::ResponseChunk { request_id, .. } => Some((request_id, StreamEvent::Chunk)),
            Message::ResponseEnd { request_id, .. } => Some((request_id, StreamEvent::End)),
            Message::Error {
                request_id: Some(request_id),
                ..
            } => Some((request_id, StreamEvent::Error)),
            _ => None,
        }
    }
}

impl fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamEvent::Start => "response_start",
            StreamEvent::Chunk => "response_chunk",
            StreamEvent::End => "response_end",
            StreamEvent::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("request {request_id} already finished ({state:?}); {event} discarded as duplicate")]
    Duplicate {
        request_id: String,
        state: StreamState,
        event: StreamEvent,
    },
    #[error("{event} is not legal in state {state:?} for request {request_id}")]
    OutOfOrder {
        request_id: String,
        state: StreamState,
        event: StreamEvent,
    },
}

/// Tracks stream state for many request ids at once.
///
/// Active streams are kept until they reach a terminal state. Finished ids are
/// remembered in a FIFO window of bounded size so late duplicates can be
/// recognised; the oldest finished id is evicted once the window is full.
#[derive(Debug)]
pub struct StreamTracker {
    active: HashMap<String, StreamState>,
    finished: HashMap<String, StreamState>,
    finished_order: VecDeque<String>,
    window: usize,
}

impl StreamTracker {
    pub fn new(window: usize) -> Self {
        Self {
            active: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::with_capacity(window.min(1024)),
            window: window.max(1),
        }
    }

    /// Current state of a request id (`Idle` if never seen or evicted)
    pub fn state(&self, request_id: &str) -> StreamState {
        self.finished
            .get(request_id)
            .or_else(|| self.active.get(request_id))
            .copied()
            .unwrap_or(StreamState::Idle)
    }

    pub fn is_known(&self, request_id: &str) -> bool {
        self.active.contains_key(request_id) || self.finished.contains_key(request_id)
    }

    pub fn is_finished(&self, request_id: &str) -> bool {
        self.finished.contains_key(request_id)
    }

    /// Number of streams that have started but not finished
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Apply an event. On error the tracked state is left untouched.
    pub fn observe(
        &mut self,
        request_id: &str,
        event: StreamEvent,
    ) -> Result<StreamState, SequenceError> {
        let next = self.state(request_id).apply(request_id, event)?;
        if next.is_terminal() {
            self.active.remove(request_id);
            self.remember_finished(request_id, next);
        } else {
            self.active.insert(request_id.to_string(), next);
        }
        Ok(next)
    }

    /// Force a request into `Errored` (e.g. abandoned on local timeout).
    /// No-op if it is already finished.
    pub fn abandon(&mut self, request_id: &str) {
        if self.finished.contains_key(request_id) {
            return;
        }
        self.active.remove(request_id);
        self.remember_finished(request_id, StreamState::Errored);
    }

    /// Ids of streams still in flight
    pub fn active_ids(&self) -> HashSet<String> {
        self.active.keys().cloned().collect()
    }

    fn remember_finished(&mut self, request_id: &str, state: StreamState) {
        self.finished.insert(request_id.to_string(), state);
        self.finished_order.push_back(request_id.to_string());
        while self.finished_order.len() > self.window {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
    }
}

impl Default for StreamTracker {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_WINDOW)
    }
}
