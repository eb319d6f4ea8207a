//! Realtime wire envelopes: JSON objects with a `type` discriminator.
//!
//! Outbound: `chat`, `document_upload`. Inbound: `chat_response`,
//! `chat_partial`, `document_upload`, plus the backend's `processing_update`,
//! `notification`, `acknowledgment` and `query_stream`. Anything else decodes
//! to a [`DeadLetter`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::optional_id_string;

/// Retrieval mode sent with each chat turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RagMode {
    #[default]
    Traditional,
    Graph,
}

impl std::str::FromStr for RagMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "traditional" | "rag" => Ok(RagMode::Traditional),
            "graph" => Ok(RagMode::Graph),
            other => Err(format!("unknown rag mode: {}", other)),
        }
    }
}

/// Client -> server envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Chat {
        content: String,
        document_id: String,
        rag_mode: RagMode,
    },
    /// Announces a freshly uploaded document so the server can start processing.
    DocumentUpload { document_id: String },
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `chat_response` content: `{answer, sources}` or a bare string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseContent {
    Structured {
        answer: String,
        #[serde(default)]
        sources: Vec<serde_json::Value>,
    },
    Text(String),
}

impl ResponseContent {
    pub fn answer(&self) -> &str {
        match self {
            ResponseContent::Structured { answer, .. } => answer,
            ResponseContent::Text(s) => s,
        }
    }

    pub fn sources(&self) -> &[serde_json::Value] {
        match self {
            ResponseContent::Structured { sources, .. } => sources,
            ResponseContent::Text(_) => &[],
        }
    }
}

/// Server -> client envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Final assistant answer for one chat turn.
    ChatResponse {
        content: ResponseContent,
        #[serde(default, deserialize_with = "optional_id_string")]
        document_id: Option<String>,
    },
    /// Streaming fragment of an assistant answer.
    ChatPartial {
        content: String,
        #[serde(default, deserialize_with = "optional_id_string")]
        document_id: Option<String>,
    },
    DocumentUpload {
        #[serde(default, deserialize_with = "optional_id_string")]
        document_id: Option<String>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        progress: Option<f64>,
    },
    ProcessingUpdate {
        #[serde(default, deserialize_with = "optional_id_string")]
        document_id: Option<String>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },
    Notification {
        #[serde(default)]
        title: Option<String>,
        message: String,
        #[serde(default)]
        level: Option<String>,
    },
    Acknowledgment {
        #[serde(default)]
        message: Option<String>,
    },
    QueryStream {
        chunk: String,
        #[serde(default)]
        done: bool,
    },
}

impl ServerEvent {
    /// Document the event is about, if it names one.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            ServerEvent::ChatResponse { document_id, .. }
            | ServerEvent::ChatPartial { document_id, .. }
            | ServerEvent::DocumentUpload { document_id, .. }
            | ServerEvent::ProcessingUpdate { document_id, .. } => document_id.as_deref(),
            _ => None,
        }
    }

    /// Wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::ChatResponse { .. } => "chat_response",
            ServerEvent::ChatPartial { .. } => "chat_partial",
            ServerEvent::DocumentUpload { .. } => "document_upload",
            ServerEvent::ProcessingUpdate { .. } => "processing_update",
            ServerEvent::Notification { .. } => "notification",
            ServerEvent::Acknowledgment { .. } => "acknowledgment",
            ServerEvent::QueryStream { .. } => "query_stream",
        }
    }
}

/// Inbound frame that could not be decoded into a [`ServerEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub raw: String,
    pub reason: String,
    pub received_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            reason: reason.into(),
            received_at: Utc::now(),
        }
    }
}

/// Decode one text frame. Unknown `type` tags and malformed JSON become dead letters.
pub fn decode_server_event(text: &str) -> Result<ServerEvent, DeadLetter> {
    serde_json::from_str(text).map_err(|e| DeadLetter::new(text, e.to_string()))
}
