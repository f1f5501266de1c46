//! Envelope types for hub ↔ client communication

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a connection declares in its `register` envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    Ui,
    Worker,
}

impl ClientRole {
    /// The role that receives `typing` notifications sent by this role
    pub fn opposite(self) -> Self {
        match self {
            ClientRole::Ui => ClientRole::Worker,
            ClientRole::Worker => ClientRole::Ui,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClientRole::Ui => "ui",
            ClientRole::Worker => "worker",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reason carried by hub-generated `error` envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRole,
    AlreadyRegistered,
    NotRegistered,
    UnauthorizedSender,
    MalformedEnvelope,
    QueueFull,
}

/// Payload of an envelope, tagged by `type` on the wire
///
/// Closed set: the router matches on it exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    /// First message after connect (client → hub)
    Register { client_type: ClientRole },
    /// Registration acknowledgement (hub → client)
    Registered { client_type: ClientRole },
    /// Hub status notice: sent on connect and when worker presence changes
    Status {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_online: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queue_depth: Option<usize>,
    },
    /// A chat request (ui → hub → worker)
    Chat {
        agent_id: String,
        content: String,
        request_id: String,
    },
    /// Begins a response stream (worker → hub → ui)
    ResponseStart { agent_id: String, request_id: String },
    /// One piece of a streamed response
    ResponseChunk {
        agent_id: String,
        request_id: String,
        content: String,
    },
    /// Terminal envelope carrying the authoritative full text
    ResponseEnd {
        agent_id: String,
        request_id: String,
        full_content: String,
    },
    /// Ephemeral typing indicator, relayed to the opposite role
    Typing {
        is_typing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    Ping,
    Pong,
    /// Hub-generated rejection, or a worker-side failure for a request
    Error {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

impl Message {
    /// Wire name of the message type (for logging)
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register { .. } => "register",
            Message::Registered { .. } => "registered",
            Message::Status { .. } => "status",
            Message::Chat { .. } => "chat",
            Message::ResponseStart { .. } => "response_start",
            Message::ResponseChunk { .. } => "response_chunk",
            Message::ResponseEnd { .. } => "response_end",
            Message::Typing { .. } => "typing",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Error { .. } => "error",
        }
    }

    /// Request id carried by chat, response and request-scoped error messages
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Message::Chat { request_id, .. }
            | Message::ResponseStart { request_id, .. }
            | Message::ResponseChunk { request_id, .. }
            | Message::ResponseEnd { request_id, .. } => Some(request_id),
            Message::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

/// One JSON object on the wire: the tagged message plus its timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Message,
    /// ISO 8601 timestamp, filled with the receive time if the sender omitted it
    #[serde(default = "now_rfc3339")]
    pub timestamp: String,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Envelope {
    /// Wrap a message with the current timestamp
    pub fn new(message: Message) -> Self {
        Self {
            message,
            timestamp: now_rfc3339(),
        }
    }

    pub fn register(role: ClientRole) -> Self {
        Self::new(Message::Register { client_type: role })
    }

    pub fn registered(role: ClientRole) -> Self {
        Self::new(Message::Registered { client_type: role })
    }

    pub fn status(content: impl Into<String>, worker_online: bool, queue_depth: usize) -> Self {
        Self::new(Message::Status {
            content: content.into(),
            worker_online: Some(worker_online),
            queue_depth: Some(queue_depth),
        })
    }

    pub fn chat(
        agent_id: impl Into<String>,
        content: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self::new(Message::Chat {
            agent_id: agent_id.into(),
            content: content.into(),
            request_id: request_id.into(),
        })
    }

    pub fn response_start(agent_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::new(Message::ResponseStart {
            agent_id: agent_id.into(),
            request_id: request_id.into(),
        })
    }

    pub fn response_chunk(
        agent_id: impl Into<String>,
        request_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(Message::ResponseChunk {
            agent_id: agent_id.into(),
            request_id: request_id.into(),
            content: content.into(),
        })
    }

    pub fn response_end(
        agent_id: impl Into<String>,
        request_id: impl Into<String>,
        full_content: impl Into<String>,
    ) -> Self {
        Self::new(Message::ResponseEnd {
            agent_id: agent_id.into(),
            request_id: request_id.into(),
            full_content: full_content.into(),
        })
    }

    pub fn typing(is_typing: bool, agent_id: Option<String>) -> Self {
        Self::new(Message::Typing {
            is_typing,
            agent_id,
        })
    }

    pub fn ping() -> Self {
        Self::new(Message::Ping)
    }

    pub fn pong() -> Self {
        Self::new(Message::Pong)
    }

    /// Error envelope scoped to a request (worker failures)
    pub fn request_error(request_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Message::Error {
            content: content.into(),
            request_id: Some(request_id.into()),
            code: None,
        })
    }

    /// Hub-generated error envelope with a machine-readable code
    pub fn error(code: ErrorCode, content: impl Into<String>, request_id: Option<String>) -> Self {
        Self::new(Message::Error {
            content: content.into(),
            request_id,
            code: Some(code),
        })
    }

    pub fn kind(&self) -> &'static str {
        self.message.kind()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.message.request_id()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
