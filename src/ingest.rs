//! Ingestion Coordinator (C4) — the per-document state machine from upload
//! acceptance to searchable completion, per §4.4.
//!
//! Stages map to progress bands (intake/dedup 0-5%, extraction 5-40%,
//! chunking 40-55%, embedding 55-95%, keyword index update 95-100%) and are
//! driven sequentially for one document; concurrency comes from running
//! many documents' state machines side by side, bounded by a semaphore
//! (`N_ingest`) the way the teacher bounds its own sync fan-out, plus a
//! per-owner mutex serializing just the Embedding stage (§4.4's "embedder is
//! a serializing bottleneck" rule) so unrelated stages of other documents
//! still overlap freely.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::chunk::{self, ChunkPolicy};
use crate::embedder::{EmbedOptions, Embedder};
use crate::error::{RagError, Result};
use crate::extract::ContentExtractor;
use crate::models::{ContentKind, DocumentState};
use crate::session::{document_progress_topic, SessionBus};
use crate::store::{CreateDocumentOutcome, NewChunk, Store};

/// Minimum spacing between progress events for a given document, per §4.4.
const PROGRESS_RATE_LIMIT: Duration = Duration::from_millis(250);

/// Payload published to `document_progress/{document_id}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProgressEvent {
    pub stage_label: String,
    pub percent: i32,
    pub state: DocumentState,
}

/// Coordinates the full Intake -> Extraction -> Chunking -> Embedding ->
/// Keyword-index pipeline for one crate instance. Cheap to clone; shares
/// its semaphore and per-owner lock table across clones.
#[derive(Clone)]
pub struct IngestionCoordinator {
    store: Arc<dyn Store>,
    embedder: Embedder,
    extractor: Arc<dyn ContentExtractor>,
    chunk_policy: ChunkPolicy,
    bus: SessionBus,
    slots: Arc<Semaphore>,
    embedding_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl IngestionCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Embedder,
        extractor: Arc<dyn ContentExtractor>,
        chunk_policy: ChunkPolicy,
        bus: SessionBus,
        n_ingest: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            extractor,
            chunk_policy,
            bus,
            slots: Arc::new(Semaphore::new(n_ingest.max(1))),
            embedding_locks: Arc::new(DashMap::new()),
        }
    }

    /// Runs the full pipeline for one document, returning its id. On
    /// `AlreadyPresent` (a byte-identical document already completed for
    /// this owner), returns immediately without re-processing.
    pub async fn ingest_document(
        &self,
        owner_id: &str,
        title: Option<&str>,
        source: &str,
        kind: ContentKind,
        bytes: &[u8],
        cancellation_token: CancellationToken,
    ) -> Result<String> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| RagError::resource_exhausted("ingestion semaphore closed"))?;

        let mut tracker = ProgressTracker::new(self.bus.clone(), String::new());

        // Stage 1: intake & dedup (0 -> 5%).
        let dedup_hash = hash_bytes(bytes);
        let result = self
            .store
            .create_document(owner_id, title, source, kind, &dedup_hash, bytes.len() as i64)
            .await?;
        let document_id = result.document_id;
        tracker.document_id = document_id.clone();

        if result.outcome == CreateDocumentOutcome::AlreadyPresent {
            tracker.emit("dedup-hit", 100, DocumentState::Completed, true).await;
            return Ok(document_id);
        }

        self.store
            .update_document_status(&document_id, DocumentState::Processing, 0, Some("intake"), None)
            .await?;
        tracker.emit("intake", 5, DocumentState::Processing, false).await;

        if let Err(e) = self
            .run_pipeline(owner_id, &document_id, kind, bytes, &cancellation_token, &mut tracker)
            .await
        {
            let cancelled = matches!(e, RagError::Cancelled { .. });
            if cancelled {
                // Any chunks inserted before the cancellation was observed
                // must not survive it, per §4.4's cancellation contract.
                self.store.delete_chunks(&document_id).await.ok();
            }
            let reason = if cancelled { "cancelled".to_string() } else { e.to_string() };
            self.store
                .update_document_status(&document_id, DocumentState::Failed, tracker.last_percent, tracker.last_stage(), Some(&reason))
                .await
                .ok();
            tracker.emit(&reason, tracker.last_percent, DocumentState::Failed, true).await;
            return Err(e);
        }

        Ok(document_id)
    }

    async fn run_pipeline(
        &self,
        owner_id: &str,
        document_id: &str,
        kind: ContentKind,
        bytes: &[u8],
        cancellation_token: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> Result<()> {
        check_cancelled(cancellation_token, document_id)?;

        // Stage 2: content extraction (5 -> 40%).
        let extracted = self.extractor.extract(bytes, kind).await.map_err(|e| {
            RagError::invalid(format!("extraction failed: {e}"))
        })?;
        self.store
            .update_document_status(document_id, DocumentState::Processing, 40, Some("extraction"), None)
            .await?;
        tracker.emit("extraction", 40, DocumentState::Processing, false).await;
        check_cancelled(cancellation_token, document_id)?;

        // Stage 3: chunking (40 -> 55%).
        let drafts = chunk::chunk(&extracted, &self.chunk_policy);
        self.store
            .update_document_status(document_id, DocumentState::Processing, 55, Some("chunking"), None)
            .await?;
        tracker.emit("chunking", 55, DocumentState::Processing, false).await;
        check_cancelled(cancellation_token, document_id)?;

        // Stage 4: embedding (55 -> 95%), serialized per owner.
        let lock = self
            .embedding_locks
            .entry(owner_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _owner_guard = lock.lock().await;

        check_cancelled(cancellation_token, document_id)?;

        let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
        let embeddings = if self.embedder.is_enabled() {
            let options = EmbedOptions {
                cancellation_token: cancellation_token.clone(),
                ..EmbedOptions::default()
            };
            self.embedder.embed_batch(&texts, options).await?
        } else {
            Vec::new()
        };
        let model_name = self.embedder.model_name().map(|s| s.to_string());

        let new_chunks: Vec<NewChunk> = drafts
            .into_iter()
            .enumerate()
            .map(|(i, draft)| NewChunk {
                content_hash: hash_bytes(draft.text.as_bytes()),
                text: draft.text,
                kind: draft.kind,
                section_path: draft.section_path,
                embedding: embeddings.get(i).cloned(),
                embedding_model: embeddings.get(i).and(model_name.clone()),
                metadata: serde_json::Value::Null,
            })
            .collect();

        check_cancelled(cancellation_token, document_id)?;
        self.store.insert_chunks(document_id, new_chunks, self.embedder.dims()).await?;
        self.store
            .update_document_status(document_id, DocumentState::Processing, 95, Some("embedding"), None)
            .await?;
        tracker.emit("embedding", 95, DocumentState::Processing, false).await;

        drop(_owner_guard);
        check_cancelled(cancellation_token, document_id)?;

        // Stage 5: keyword index update (95 -> 100%).
        self.store.rebuild_bm25_index(owner_id).await?;
        self.store
            .update_document_status(document_id, DocumentState::Completed, 100, Some("completed"), None)
            .await?;
        tracker.emit("completed", 100, DocumentState::Completed, true).await;

        Ok(())
    }
}

fn check_cancelled(token: &CancellationToken, document_id: &str) -> Result<()> {
    if token.is_cancelled() {
        Err(RagError::Cancelled { correlation_id: document_id.to_string() })
    } else {
        Ok(())
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Rate-limits progress events to one per [`PROGRESS_RATE_LIMIT`] per
/// document, always letting the final (state-change) event through
/// regardless of spacing, per §4.4.
struct ProgressTracker {
    bus: SessionBus,
    document_id: String,
    last_emitted_at: Option<Instant>,
    last_percent: i32,
    last_stage: Option<String>,
}

impl ProgressTracker {
    fn new(bus: SessionBus, document_id: String) -> Self {
        Self { bus, document_id, last_emitted_at: None, last_percent: 0, last_stage: None }
    }

    fn last_stage(&self) -> Option<&str> {
        self.last_stage.as_deref()
    }

    async fn emit(&mut self, stage_label: &str, percent: i32, state: DocumentState, is_final: bool) {
        self.last_percent = percent;
        self.last_stage = Some(stage_label.to_string());

        let should_emit = is_final
            || self
                .last_emitted_at
                .map(|t| t.elapsed() >= PROGRESS_RATE_LIMIT)
                .unwrap_or(true);
        if !should_emit {
            return;
        }
        self.last_emitted_at = Some(Instant::now());

        let event = ProgressEvent { stage_label: stage_label.to_string(), percent, state };
        if let Ok(payload) = serde_json::to_string(&event) {
            self.bus.publish(&document_progress_topic(&self.document_id), payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::extract::PlainTextExtractor;
    use crate::migrate::run_migrations;
    use crate::store::SqlStore;

    async fn test_coordinator() -> (IngestionCoordinator, SessionBus) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(SqlStore::new(pool));
        let embedder = Embedder::new(EmbeddingConfig { provider: "disabled".to_string(), ..EmbeddingConfig::default() });
        let extractor: Arc<dyn ContentExtractor> = Arc::new(PlainTextExtractor::new());
        let bus = SessionBus::new(Duration::from_secs(3600));
        let coordinator = IngestionCoordinator::new(store, embedder, extractor, ChunkPolicy::default(), bus.clone(), 2);
        (coordinator, bus)
    }

    #[tokio::test]
    async fn ingests_a_plain_text_document_to_completion() {
        let (coordinator, _bus) = test_coordinator().await;
        let doc_id = coordinator
            .ingest_document(
                "owner-1",
                Some("My Doc"),
                "unit-test",
                ContentKind::Text,
                b"First paragraph.\n\nSecond paragraph with more words in it.",
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let doc = coordinator.store.get_document(&doc_id).await.unwrap().unwrap();
        assert_eq!(doc.state, DocumentState::Completed);
        assert_eq!(doc.progress, 100);
        assert!(doc.chunk_count > 0);
    }

    #[tokio::test]
    async fn reingesting_identical_bytes_reuses_document_id() {
        let (coordinator, _bus) = test_coordinator().await;
        let bytes = b"Only one paragraph here.";
        let first = coordinator
            .ingest_document("owner-1", None, "src", ContentKind::Text, bytes, CancellationToken::new())
            .await
            .unwrap();
        let second = coordinator
            .ingest_document("owner-1", None, "src", ContentKind::Text, bytes, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn pre_cancelled_token_fails_document_with_cancelled_reason() {
        let (coordinator, _bus) = test_coordinator().await;
        let token = CancellationToken::new();
        token.cancel();
        let doc_id = coordinator
            .ingest_document("owner-1", None, "src", ContentKind::Text, b"some text", token)
            .await
            .unwrap_err();
        assert!(matches!(doc_id, RagError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn progress_events_are_published_on_document_topic() {
        let (coordinator, bus) = test_coordinator().await;
        let bytes = b"hello world, this document has progress events.";
        let dedup_hash = hash_bytes(bytes);

        // Pre-create the document row so the id is known before ingestion
        // starts, allowing the test to subscribe before the first event.
        let precreated = coordinator
            .store
            .create_document("owner-1", None, "src", ContentKind::Text, &dedup_hash, bytes.len() as i64)
            .await
            .unwrap();

        let mut rx = bus.subscribe(&document_progress_topic(&precreated.document_id));

        let doc_id = coordinator
            .ingest_document("owner-1", None, "src", ContentKind::Text, bytes, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(doc_id, precreated.document_id);

        let mut last_event: Option<ProgressEvent> = None;
        while let Ok(payload) = rx.try_recv() {
            last_event = serde_json::from_str(&payload).ok();
        }
        let last_event = last_event.expect("at least one progress event should have been published");
        assert_eq!(last_event.percent, 100);
        assert_eq!(last_event.state, DocumentState::Completed);
    }
}
