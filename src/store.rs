//! `Store` (C1) — sole authority over durable state: documents, chunks (with
//! embeddings), conversations, and messages.
//!
//! Consolidates what the teacher split across `search.rs`, `get.rs`, and
//! `ingest.rs`'s direct SQL calls into one narrow, transactional API, so the
//! rest of the core never embeds SQL. `SqlStore` is the only implementation;
//! it is kept behind the [`Store`] trait so retrieval and chat code can be
//! exercised against an in-memory fake in tests without a real database.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{Row, SqlitePool};

use crate::bm25::Bm25Index;
use crate::embedding;
use crate::error::{RagError, Result};
use crate::models::{
    Chunk, ContentKind, Conversation, Document, DocumentState, Message, MessageMetadata,
    MessageRole,
};

/// Outcome of [`Store::create_document`] — distinguishes a fresh row from a
/// dedup hit so the Ingestion Coordinator knows whether to reprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDocumentOutcome {
    Created,
    AlreadyPresent,
}

/// A document row paired with which branch [`Store::create_document`] took.
#[derive(Debug, Clone)]
pub struct CreateDocumentResult {
    pub document_id: String,
    pub outcome: CreateDocumentOutcome,
}

/// A chunk to be inserted, produced by the Chunker + Embedder and not yet
/// assigned an id or ordinal.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub text: String,
    pub content_hash: String,
    pub kind: String,
    pub section_path: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub metadata: JsonValue,
}

/// One scored hit from [`Store::vector_search`] or [`Store::lexical_search`].
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub document_title: Option<String>,
    pub score: f32,
}

/// Optional filters narrowing [`Store::vector_search`] / [`Store::lexical_search`].
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub document_ids: Option<Vec<String>>,
}

/// Sole authority over durable state, per §4.1.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_document(
        &self,
        owner_id: &str,
        title: Option<&str>,
        source: &str,
        kind: ContentKind,
        dedup_hash: &str,
        byte_size: i64,
    ) -> Result<CreateDocumentResult>;

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>>;

    async fn update_document_status(
        &self,
        document_id: &str,
        state: DocumentState,
        progress: i32,
        stage: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<()>;

    async fn insert_chunks(&self, document_id: &str, chunks: Vec<NewChunk>, dims: usize) -> Result<usize>;

    /// Deletes every chunk belonging to `document_id` (and their FTS/vector
    /// rows) without touching the document row itself, resetting
    /// `chunk_count` to 0. Used by the Ingestion Coordinator's cancellation
    /// cleanup, which must leave the document in `failed` state rather than
    /// deleting it outright. Idempotent.
    async fn delete_chunks(&self, document_id: &str) -> Result<()>;

    async fn delete_document(&self, document_id: &str) -> Result<()>;

    async fn vector_search(
        &self,
        owner_id: &str,
        query_embedding: &[f32],
        k: i64,
        filters: Option<&SearchFilters>,
    ) -> Result<Vec<ScoredChunk>>;

    async fn lexical_search(&self, owner_id: &str, query: &str, k: i64) -> Result<Vec<ScoredChunk>>;

    async fn rebuild_bm25_index(&self, owner_id: &str) -> Result<Bm25Index>;

    async fn create_conversation(&self, owner_id: &str, title: Option<&str>) -> Result<Conversation>;

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>>;

    async fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<Message>;

    async fn update_message_content(
        &self,
        message_id: &str,
        new_content: &str,
        metadata: MessageMetadata,
    ) -> Result<()>;

    async fn delete_message(&self, message_id: &str) -> Result<()>;

    async fn list_messages(
        &self,
        conversation_id: &str,
        before_cursor: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Message>>;
}

/// sqlx-backed [`Store`] implementation over the schema created by
/// [`crate::migrate::run_migrations`].
pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let state_str: String = row.get("state");
    let kind_str: String = row.get("kind");
    let created_ts: i64 = row.get("created_at");
    let processed_ts: Option<i64> = row.get("processed_at");

    Ok(Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        title: row.get("title"),
        source: row.get("source"),
        kind: ContentKind::parse(&kind_str)
            .ok_or_else(|| RagError::invalid(format!("unknown content kind in store: {kind_str}")))?,
        byte_size: row.get("byte_size"),
        dedup_hash: row.get("dedup_hash"),
        state: DocumentState::parse(&state_str)
            .ok_or_else(|| RagError::invalid(format!("unknown document state in store: {state_str}")))?,
        progress: row.get("progress"),
        stage: row.get("stage"),
        chunk_count: row.get("chunk_count"),
        created_at: chrono::DateTime::from_timestamp(created_ts, 0).unwrap_or_else(Utc::now),
        processed_at: processed_ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
        failure_reason: row.get("failure_reason"),
    })
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
    let section_path_json: String = row.get("section_path");
    let metadata_json: String = row.get("metadata_json");
    let created_ts: i64 = row.get("created_at");

    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        ordinal: row.get("ordinal"),
        text: row.get("text"),
        content_hash: row.get("content_hash"),
        kind: row.get("kind"),
        char_count: row.get("char_count"),
        token_count: row.get("token_count"),
        section_path: serde_json::from_str(&section_path_json).unwrap_or_default(),
        embedding: None,
        embedding_model: row.get("embedding_model"),
        created_at: chrono::DateTime::from_timestamp(created_ts, 0).unwrap_or_else(Utc::now),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(JsonValue::Null),
    })
}

#[async_trait]
impl Store for SqlStore {
    async fn create_document(
        &self,
        owner_id: &str,
        title: Option<&str>,
        source: &str,
        kind: ContentKind,
        dedup_hash: &str,
        byte_size: i64,
    ) -> Result<CreateDocumentResult> {
        if let Some(row) = sqlx::query("SELECT id, state FROM documents WHERE owner_id = ? AND dedup_hash = ?")
            .bind(owner_id)
            .bind(dedup_hash)
            .fetch_optional(&self.pool)
            .await?
        {
            let id: String = row.get("id");
            let state: String = row.get("state");
            if state == DocumentState::Completed.as_str() {
                return Ok(CreateDocumentResult {
                    document_id: id,
                    outcome: CreateDocumentOutcome::AlreadyPresent,
                });
            }
            return Ok(CreateDocumentResult {
                document_id: id,
                outcome: CreateDocumentOutcome::Created,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO documents (id, owner_id, title, source, kind, byte_size, dedup_hash, state, progress, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?)
            "#,
        )
        .bind(&id)
        .bind(owner_id)
        .bind(title)
        .bind(source)
        .bind(kind.as_str())
        .bind(byte_size)
        .bind(dedup_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(CreateDocumentResult {
            document_id: id,
            outcome: CreateDocumentOutcome::Created,
        })
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn update_document_status(
        &self,
        document_id: &str,
        state: DocumentState,
        progress: i32,
        stage: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        let existing = self
            .get_document(document_id)
            .await?
            .ok_or_else(|| RagError::invalid(format!("document not found: {document_id}")))?;

        if existing.state == DocumentState::Processing && progress < existing.progress {
            return Err(RagError::conflict(format!(
                "progress must be non-decreasing while processing: {} -> {}",
                existing.progress, progress
            )));
        }

        let processed_at = matches!(state, DocumentState::Completed | DocumentState::Failed)
            .then(|| Utc::now().timestamp());

        sqlx::query(
            r#"
            UPDATE documents
            SET state = ?, progress = ?, stage = ?, failure_reason = ?, processed_at = COALESCE(?, processed_at)
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(progress)
        .bind(stage)
        .bind(failure_reason)
        .bind(processed_at)
        .bind(document_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_chunks(&self, document_id: &str, chunks: Vec<NewChunk>, dims: usize) -> Result<usize> {
        for c in &chunks {
            if let Some(embedding) = &c.embedding {
                if embedding.len() != dims {
                    return Err(RagError::invalid(format!(
                        "embedding length {} does not match configured dims {}",
                        embedding.len(),
                        dims
                    )));
                }
            }
        }

        let mut tx = self.pool.begin().await.map_err(RagError::StoreUnavailable)?;

        let existing_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&mut *tx)
            .await?;

        let mut ordinal = existing_count;
        let now = Utc::now().timestamp();
        let count = chunks.len();

        for c in chunks {
            let chunk_id = uuid::Uuid::new_v4().to_string();
            let section_path_json = serde_json::to_string(&c.section_path).unwrap_or_else(|_| "[]".to_string());
            let metadata_json = serde_json::to_string(&c.metadata).unwrap_or_else(|_| "{}".to_string());

            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, ordinal, text, content_hash, kind, char_count, token_count, section_path, embedding_model, created_at, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk_id)
            .bind(document_id)
            .bind(ordinal)
            .bind(&c.text)
            .bind(&c.content_hash)
            .bind(&c.kind)
            .bind(c.text.chars().count() as i64)
            .bind(c.text.split_whitespace().count() as i64)
            .bind(&section_path_json)
            .bind(&c.embedding_model)
            .bind(now)
            .bind(&metadata_json)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunks_fts (chunk_id, document_id, owner_id, text) VALUES (?, ?, (SELECT owner_id FROM documents WHERE id = ?), ?)",
            )
            .bind(&chunk_id)
            .bind(document_id)
            .bind(document_id)
            .bind(&c.text)
            .execute(&mut *tx)
            .await?;

            if let Some(embedding) = c.embedding {
                let blob = embedding::vec_to_blob(&embedding);
                sqlx::query(
                    "INSERT INTO chunk_vectors (chunk_id, document_id, owner_id, embedding) VALUES (?, ?, (SELECT owner_id FROM documents WHERE id = ?), ?)",
                )
                .bind(&chunk_id)
                .bind(document_id)
                .bind(document_id)
                .bind(&blob)
                .execute(&mut *tx)
                .await?;
            }

            ordinal += 1;
        }

        sqlx::query("UPDATE documents SET chunk_count = ? WHERE id = ?")
            .bind(ordinal)
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(RagError::StoreUnavailable)?;
        Ok(count)
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(RagError::StoreUnavailable)?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE documents SET chunk_count = 0 WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(RagError::StoreUnavailable)?;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(RagError::StoreUnavailable)?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(RagError::StoreUnavailable)?;
        Ok(())
    }

    async fn vector_search(
        &self,
        owner_id: &str,
        query_embedding: &[f32],
        k: i64,
        filters: Option<&SearchFilters>,
    ) -> Result<Vec<ScoredChunk>> {
        // Brute-force cosine scan, matching the teacher's existing semantic
        // search. Sub-100ms behavior above ~50k chunks requires an
        // approximate index, which is a documented limitation (see
        // DESIGN.md) rather than something solved here.
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.embedding, c.*, d.title AS document_title
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            JOIN documents d ON d.id = cv.document_id
            WHERE cv.owner_id = ? AND d.state = 'completed'
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<ScoredChunk> = rows
            .iter()
            .filter(|row| {
                filters
                    .and_then(|f| f.document_ids.as_ref())
                    .map(|ids| ids.iter().any(|id| id == &row.get::<String, _>("document_id")))
                    .unwrap_or(true)
            })
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = embedding::blob_to_vec(&blob);
                let score = embedding::cosine_similarity(query_embedding, &vec);
                Ok(ScoredChunk {
                    chunk: row_to_chunk(row)?,
                    document_title: row.get("document_title"),
                    score,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k.max(0) as usize);
        Ok(hits)
    }

    async fn lexical_search(&self, owner_id: &str, query: &str, k: i64) -> Result<Vec<ScoredChunk>> {
        let index = self.rebuild_bm25_index(owner_id).await?;
        let hits = index.search(query, k.max(0) as usize);
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let row = sqlx::query(
                r#"
                SELECT c.*, d.title AS document_title
                FROM chunks c
                JOIN documents d ON d.id = c.document_id
                WHERE c.id = ? AND d.state = 'completed'
                "#,
            )
            .bind(&hit.chunk_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                out.push(ScoredChunk {
                    chunk: row_to_chunk(&row)?,
                    document_title: row.get("document_title"),
                    score: hit.score,
                });
            }
        }
        Ok(out)
    }

    async fn rebuild_bm25_index(&self, owner_id: &str) -> Result<Bm25Index> {
        let rows = sqlx::query(
            r#"
            SELECT c.id AS chunk_id, c.text
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.owner_id = ? AND d.state = 'completed'
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let pairs: Vec<(String, String)> = rows
            .iter()
            .map(|r| (r.get::<String, _>("chunk_id"), r.get::<String, _>("text")))
            .collect();

        let index = Bm25Index::new(crate::bm25::Bm25Params::default());
        index.rebuild(pairs.iter().map(|(id, text)| (id.as_str(), text.as_str())));
        Ok(index)
    }

    async fn create_conversation(&self, owner_id: &str, title: Option<&str>) -> Result<Conversation> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_ts = now.timestamp();

        sqlx::query("INSERT INTO conversations (id, owner_id, title, created_at, updated_at) VALUES (?, ?, ?, ?, ?)")
            .bind(&id)
            .bind(owner_id)
            .bind(title)
            .bind(now_ts)
            .bind(now_ts)
            .execute(&self.pool)
            .await?;

        Ok(Conversation {
            id,
            owner_id: owner_id.to_string(),
            title: title.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| {
            let created_ts: i64 = row.get("created_at");
            let updated_ts: i64 = row.get("updated_at");
            Conversation {
                id: row.get("id"),
                owner_id: row.get("owner_id"),
                title: row.get("title"),
                created_at: chrono::DateTime::from_timestamp(created_ts, 0).unwrap_or_else(Utc::now),
                updated_at: chrono::DateTime::from_timestamp(updated_ts, 0).unwrap_or_else(Utc::now),
            }
        }))
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<Message> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_ts = now.timestamp();
        let metadata_json = serde_json::to_string(&metadata).unwrap_or_else(|_| "{}".to_string());

        let mut tx = self.pool.begin().await.map_err(RagError::StoreUnavailable)?;

        sqlx::query("INSERT INTO messages (id, conversation_id, role, content, created_at, metadata_json) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(&id)
            .bind(conversation_id)
            .bind(role.as_str())
            .bind(content)
            .bind(now_ts)
            .bind(&metadata_json)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(now_ts)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(RagError::StoreUnavailable)?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
            metadata,
        })
    }

    async fn update_message_content(
        &self,
        message_id: &str,
        new_content: &str,
        metadata: MessageMetadata,
    ) -> Result<()> {
        let metadata_json = serde_json::to_string(&metadata).unwrap_or_else(|_| "{}".to_string());
        sqlx::query("UPDATE messages SET content = ?, metadata_json = ? WHERE id = ?")
            .bind(new_content)
            .bind(&metadata_json)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        before_cursor: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let rows = if let Some(cursor) = before_cursor {
            sqlx::query(
                r#"
                SELECT * FROM messages
                WHERE conversation_id = ? AND id < ?
                ORDER BY created_at DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(conversation_id)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                SELECT * FROM messages
                WHERE conversation_id = ?
                ORDER BY created_at DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(conversation_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter()
            .map(|row| {
                let role_str: String = row.get("role");
                let created_ts: i64 = row.get("created_at");
                let metadata_json: String = row.get("metadata_json");
                Ok(Message {
                    id: row.get("id"),
                    conversation_id: row.get("conversation_id"),
                    role: MessageRole::parse(&role_str)
                        .ok_or_else(|| RagError::invalid(format!("unknown message role in store: {role_str}")))?,
                    content: row.get("content"),
                    created_at: chrono::DateTime::from_timestamp(created_ts, 0).unwrap_or_else(Utc::now),
                    metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations;

    async fn test_store() -> SqlStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqlStore::new(pool)
    }

    #[tokio::test]
    async fn create_document_is_dedup_aware() {
        let store = test_store().await;
        let first = store
            .create_document("u1", Some("t"), "upload", ContentKind::Text, "hash-a", 10)
            .await
            .unwrap();
        assert_eq!(first.outcome, CreateDocumentOutcome::Created);

        store
            .update_document_status(&first.document_id, DocumentState::Completed, 100, None, None)
            .await
            .unwrap();

        let second = store
            .create_document("u1", Some("t"), "upload", ContentKind::Text, "hash-a", 10)
            .await
            .unwrap();
        assert_eq!(second.document_id, first.document_id);
        assert_eq!(second.outcome, CreateDocumentOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn progress_must_not_decrease_while_processing() {
        let store = test_store().await;
        let doc = store
            .create_document("u1", None, "upload", ContentKind::Text, "h", 1)
            .await
            .unwrap();
        store
            .update_document_status(&doc.document_id, DocumentState::Processing, 50, Some("chunking"), None)
            .await
            .unwrap();

        let err = store
            .update_document_status(&doc.document_id, DocumentState::Processing, 10, Some("chunking"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Conflict(_)));
    }

    #[tokio::test]
    async fn insert_chunks_assigns_dense_ordinals() {
        let store = test_store().await;
        let doc = store
            .create_document("u1", None, "upload", ContentKind::Text, "h", 1)
            .await
            .unwrap();

        let chunks = vec![
            NewChunk {
                text: "alpha".into(),
                content_hash: "a".into(),
                kind: "paragraph".into(),
                section_path: vec![],
                embedding: Some(vec![0.0; 4]),
                embedding_model: Some("test".into()),
                metadata: JsonValue::Null,
            },
            NewChunk {
                text: "beta".into(),
                content_hash: "b".into(),
                kind: "paragraph".into(),
                section_path: vec![],
                embedding: Some(vec![0.0; 4]),
                embedding_model: Some("test".into()),
                metadata: JsonValue::Null,
            },
        ];
        let count = store.insert_chunks(&doc.document_id, chunks, 4).await.unwrap();
        assert_eq!(count, 2);

        let document = store.get_document(&doc.document_id).await.unwrap().unwrap();
        assert_eq!(document.chunk_count, 2);
    }

    #[tokio::test]
    async fn delete_chunks_clears_rows_but_keeps_document_and_is_idempotent() {
        let store = test_store().await;
        let doc = store
            .create_document("u1", None, "upload", ContentKind::Text, "h", 1)
            .await
            .unwrap();
        store
            .insert_chunks(
                &doc.document_id,
                vec![NewChunk {
                    text: "alpha".into(),
                    content_hash: "a".into(),
                    kind: "paragraph".into(),
                    section_path: vec![],
                    embedding: Some(vec![1.0, 0.0]),
                    embedding_model: Some("test".into()),
                    metadata: JsonValue::Null,
                }],
                2,
            )
            .await
            .unwrap();

        store.delete_chunks(&doc.document_id).await.unwrap();
        let document = store.get_document(&doc.document_id).await.unwrap().unwrap();
        assert_eq!(document.chunk_count, 0);
        assert!(store.vector_search("u1", &[1.0, 0.0], 10, None).await.unwrap().is_empty());

        // Idempotent: a second call on an already-empty document is a no-op, not an error.
        store.delete_chunks(&doc.document_id).await.unwrap();
        assert!(store.get_document(&doc.document_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn insert_chunks_rejects_mismatched_embedding_length() {
        let store = test_store().await;
        let doc = store
            .create_document("u1", None, "upload", ContentKind::Text, "h", 1)
            .await
            .unwrap();

        let chunks = vec![NewChunk {
            text: "alpha".into(),
            content_hash: "a".into(),
            kind: "paragraph".into(),
            section_path: vec![],
            embedding: Some(vec![0.0; 3]),
            embedding_model: Some("test".into()),
            metadata: JsonValue::Null,
        }];
        let err = store.insert_chunks(&doc.document_id, chunks, 4).await.unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn delete_document_is_idempotent() {
        let store = test_store().await;
        let doc = store
            .create_document("u1", None, "upload", ContentKind::Text, "h", 1)
            .await
            .unwrap();
        store.delete_document(&doc.document_id).await.unwrap();
        store.delete_document(&doc.document_id).await.unwrap();
        assert!(store.get_document(&doc.document_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn vector_search_excludes_non_completed_documents() {
        let store = test_store().await;
        let doc = store
            .create_document("u1", None, "upload", ContentKind::Text, "h", 1)
            .await
            .unwrap();
        store
            .insert_chunks(
                &doc.document_id,
                vec![NewChunk {
                    text: "pending content".into(),
                    content_hash: "a".into(),
                    kind: "paragraph".into(),
                    section_path: vec![],
                    embedding: Some(vec![1.0, 0.0]),
                    embedding_model: Some("test".into()),
                    metadata: JsonValue::Null,
                }],
                2,
            )
            .await
            .unwrap();

        let hits = store.vector_search("u1", &[1.0, 0.0], 10, None).await.unwrap();
        assert!(hits.is_empty(), "pending document's chunks must not be searchable");

        store
            .update_document_status(&doc.document_id, DocumentState::Completed, 100, None, None)
            .await
            .unwrap();
        let hits = store.vector_search("u1", &[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn messages_are_paginated_newest_first() {
        let store = test_store().await;
        let convo = store.create_conversation("u1", None).await.unwrap();
        store
            .append_message(&convo.id, MessageRole::User, "first", MessageMetadata::default())
            .await
            .unwrap();
        store
            .append_message(&convo.id, MessageRole::Assistant, "second", MessageMetadata::default())
            .await
            .unwrap();

        let page = store.list_messages(&convo.id, None, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "second");
    }
}
