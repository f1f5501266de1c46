//! Offline queue: chat envelopes waiting for a worker

use super::registry::ConnectionHandle;
use crate::protocol::Envelope;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// What happened to a chat envelope handed to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Forwarded immediately to this many worker connections
    Routed(usize),
    /// Buffered; `depth` is the buffer depth after appending
    Queued { depth: usize },
    /// Refused because the configured depth limit is reached
    Rejected { depth: usize },
}

/// Strict FIFO buffer of chat envelopes addressed to the worker role
#[derive(Debug, Default)]
pub struct OfflineQueue {
    buffer: VecDeque<Envelope>,
    max_depth: Option<usize>,
}

impl OfflineQueue {
    /// Create a queue; `None` means unbounded
    pub fn new(max_depth: Option<usize>) -> Self {
        Self {
            buffer: VecDeque::new(),
            max_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    /// Forward to every worker, or buffer if none can take it.
    ///
    /// A non-empty buffer means a flush is owed; callers flush on worker
    /// registration, so anything arriving while the buffer is non-empty
    /// goes behind it to keep arrival order.
    pub fn enqueue_or_route(&mut self, envelope: Envelope, workers: &[ConnectionHandle]) -> QueueOutcome {
        if self.buffer.is_empty() {
            let delivered = deliver(&envelope, workers);
            if delivered > 0 {
                debug!(
                    request_id = envelope.request_id().unwrap_or_default(),
                    workers = delivered,
                    "Chat routed to worker"
                );
                return QueueOutcome::Routed(delivered);
            }
        }

        if let Some(max) = self.max_depth {
            if self.buffer.len() >= max {
                warn!(
                    request_id = envelope.request_id().unwrap_or_default(),
                    queue_depth = self.buffer.len(),
                    "Offline queue full, refusing chat"
                );
                return QueueOutcome::Rejected {
                    depth: self.buffer.len(),
                };
            }
        }

        self.buffer.push_back(envelope);
        let depth = self.buffer.len();
        info!(queue_depth = depth, "No worker connected, chat queued");
        QueueOutcome::Queued { depth }
    }

    /// Forward every buffered envelope in arrival order, then clear the buffer.
    ///
    /// Stops early (keeping the remainder) if no worker accepts an envelope.
    /// Returns the number of envelopes forwarded.
    pub fn flush(&mut self, workers: &[ConnectionHandle]) -> usize {
        let mut flushed = 0;
        while let Some(envelope) = self.buffer.front() {
            if deliver(envelope, workers) == 0 {
                warn!(
                    remaining = self.buffer.len(),
                    "Flush interrupted: no worker accepted the envelope"
                );
                break;
            }
            self.buffer.pop_front();
            flushed += 1;
        }
        if flushed > 0 {
            info!(flushed, queue_depth = self.buffer.len(), "Offline queue flushed");
        }
        flushed
    }
}

fn deliver(envelope: &Envelope, workers: &[ConnectionHandle]) -> usize {
    workers
        .iter()
        .filter(|worker| worker.send(envelope.clone()))
        .count()
}
