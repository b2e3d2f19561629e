//! Core data types that flow through ingestion, retrieval, and chat.
//!
//! Durable rows (`Document`, `Chunk`, `Conversation`, `Message`) are owned by
//! the [`crate::store`] module; `RetrievalResult` and `SessionState` are
//! transient value objects that never touch SQLite directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared content kind of an ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Pdf,
    Html,
    Text,
    Image,
    Markdown,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Pdf => "pdf",
            ContentKind::Html => "html",
            ContentKind::Text => "text",
            ContentKind::Image => "image",
            ContentKind::Markdown => "markdown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(ContentKind::Pdf),
            "html" => Some(ContentKind::Html),
            "text" => Some(ContentKind::Text),
            "image" => Some(ContentKind::Image),
            "markdown" => Some(ContentKind::Markdown),
            _ => None,
        }
    }
}

/// Lifecycle state of a [`Document`], driven exclusively by the Ingestion
/// Coordinator (`crate::ingest`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::Pending => "pending",
            DocumentState::Processing => "processing",
            DocumentState::Completed => "completed",
            DocumentState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentState::Pending),
            "processing" => Some(DocumentState::Processing),
            "completed" => Some(DocumentState::Completed),
            "failed" => Some(DocumentState::Failed),
            _ => None,
        }
    }
}

/// A unit of ingested content, owned by `owner_id`.
///
/// `dedup_hash` is a digest of the raw bytes; `(owner_id, dedup_hash)` is
/// unique — re-uploading identical content returns the existing id rather
/// than reprocessing (see `Store::create_document`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub title: Option<String>,
    pub source: String,
    pub kind: ContentKind,
    pub byte_size: i64,
    pub dedup_hash: String,
    pub state: DocumentState,
    pub progress: i32,
    pub stage: Option<String>,
    pub chunk_count: i64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// A retrievable fragment of a document.
///
/// `embedding` is present once the Embedding stage has run; its length, when
/// present, is always exactly the configured dimension `D`.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub text: String,
    pub content_hash: String,
    pub kind: String,
    pub char_count: i64,
    pub token_count: i64,
    pub section_path: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// An ordered message history for one owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub owner_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Speaking role of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// One turn in a [`Conversation`].
///
/// `metadata` carries retrieval sources, model id, token count, and response
/// latency for assistant turns; it is empty for user/system turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub metadata: MessageMetadata,
}

/// Structured metadata attached to an assistant [`Message`] at finalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<MessageSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A weak reference to the chunk a sourced answer drew from. The chunk may
/// since have been deleted; resolving it is always optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSource {
    pub chunk_id: String,
    pub document_title: Option<String>,
    pub section: Option<String>,
    pub similarity: f32,
}

/// Transient value object returned by the Hybrid Retriever and Reranker.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub document_id: String,
    pub document_title: Option<String>,
    pub section_path: Vec<String>,
    pub content: String,
    /// Fused (or, post-rerank, cross-encoder) relevance score in `[0, 1]`.
    pub score: f32,
    pub vector_score: Option<f32>,
    pub lexical_score: Option<f32>,
    pub rerank_score: Option<f32>,
}

/// Per-connected-client state held by the Session Bus.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub owner_id: String,
    pub current_conversation_id: Option<String>,
    pub in_flight_stream_handle: Option<String>,
    pub last_activity_at: DateTime<Utc>,
}
