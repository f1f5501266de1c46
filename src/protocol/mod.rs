//! Wire protocol shared by the hub, UI clients and the worker
//!
//! This module provides:
//! - `Envelope` / `Message`: the typed JSON envelope exchanged over every connection
//! - `StreamState` / `StreamTracker`: the per-request start → chunk* → end state machine

mod stream;
mod types;

pub use stream::{SequenceError, StreamEvent, StreamState, StreamTracker, DEFAULT_STREAM_WINDOW};
pub use types::{ClientRole, Envelope, ErrorCode, Message};
