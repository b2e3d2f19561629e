//! End-to-end tests driving the library's public surface: ingest a document,
//! retrieve it, and run a full chat turn, all through an in-memory SQLite
//! database and a stub LLM provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use tokio_util::sync::CancellationToken;

use ragcore::chat::{ChatOrchestrator, ChatRequest, PromptTemplate};
use ragcore::chunk::ChunkPolicy;
use ragcore::config::EmbeddingConfig;
use ragcore::embedder::Embedder;
use ragcore::error::{RagError, Result};
use ragcore::extract::PlainTextExtractor;
use ragcore::ingest::IngestionCoordinator;
use ragcore::llm::{GenerateOptions, HealthStatus, LlmProvider, TokenStream};
use ragcore::migrate;
use ragcore::models::ContentKind;
use ragcore::retrieval::HybridRetriever;
use ragcore::session::SessionBus;
use ragcore::store::{SqlStore, Store};

async fn fresh_store() -> Arc<dyn Store> {
    let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    Arc::new(SqlStore::new(pool))
}

fn disabled_embedder() -> Embedder {
    Embedder::new(EmbeddingConfig { provider: "disabled".to_string(), ..EmbeddingConfig::default() })
}

fn coordinator(store: Arc<dyn Store>, bus: SessionBus) -> IngestionCoordinator {
    IngestionCoordinator::new(store, disabled_embedder(), Arc::new(PlainTextExtractor::new()), ChunkPolicy::default(), bus, 4)
}

/// An `LlmProvider` that echoes back a fixed reply, for deterministic chat
/// orchestration tests that don't exercise a real model.
struct EchoProvider {
    reply: &'static str,
}

#[async_trait]
impl LlmProvider for EchoProvider {
    async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<String> {
        Ok(self.reply.to_string())
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _options: &GenerateOptions,
        _cancellation_token: CancellationToken,
    ) -> Result<TokenStream> {
        let words: Vec<Result<String>> = self.reply.split(' ').map(|w| Ok(format!("{w} "))).collect();
        Ok(Box::pin(futures_util::stream::iter(words)))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["echo".to_string()])
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// Basic round trip: ingest a document, then find it via lexical retrieval
/// scoped to its owner (spec §8 scenario 1).
#[tokio::test]
async fn ingest_then_retrieve_round_trip() {
    let store = fresh_store().await;
    let bus = SessionBus::new(Duration::from_secs(3600));
    let coordinator = coordinator(store.clone(), bus);

    let body = b"Kubernetes deployments roll out new pods gradually during an upgrade.";
    let document_id = coordinator
        .ingest_document("owner-a", Some("k8s notes"), "upload", ContentKind::Text, body, CancellationToken::new())
        .await
        .unwrap();

    let doc = store.get_document(&document_id).await.unwrap().unwrap();
    assert_eq!(doc.state, ragcore::models::DocumentState::Completed);
    assert!(doc.chunk_count > 0);

    let embedder = disabled_embedder();
    let retriever = HybridRetriever::new(store.as_ref(), &embedder, Default::default());
    let results = retriever
        .retrieve("owner-a", &["kubernetes pod rollout".to_string()], true, None)
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert_eq!(results[0].document_id, document_id);
}

/// A retrieval scoped to a different owner must not see another owner's
/// documents, even when the lexical match would otherwise be perfect.
#[tokio::test]
async fn retrieval_is_owner_scoped() {
    let store = fresh_store().await;
    let bus = SessionBus::new(Duration::from_secs(3600));
    let coordinator = coordinator(store.clone(), bus);

    coordinator
        .ingest_document("owner-a", None, "upload", ContentKind::Text, b"secret project codename falcon", CancellationToken::new())
        .await
        .unwrap();

    let embedder = disabled_embedder();
    let retriever = HybridRetriever::new(store.as_ref(), &embedder, Default::default());
    let results = retriever
        .retrieve("owner-b", &["falcon".to_string()], true, None)
        .await
        .unwrap();

    assert!(results.is_empty());
}

/// Re-ingesting byte-identical content for the same owner returns the same
/// document id instead of reprocessing it (spec §8 scenario 2).
#[tokio::test]
async fn reingesting_identical_content_is_idempotent() {
    let store = fresh_store().await;
    let bus = SessionBus::new(Duration::from_secs(3600));
    let coordinator = coordinator(store.clone(), bus);

    let body = b"This document is uploaded twice in a row.";
    let first = coordinator
        .ingest_document("owner-a", None, "upload", ContentKind::Text, body, CancellationToken::new())
        .await
        .unwrap();
    let second = coordinator
        .ingest_document("owner-a", None, "upload", ContentKind::Text, body, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first, second);
    let doc = store.get_document(&first).await.unwrap().unwrap();
    assert!(doc.chunk_count > 0);
}

/// Runs a full chat turn end to end: persists the user message, retrieves
/// context, streams a reply from a stub provider, and finalizes the
/// assistant message with sources attached.
#[tokio::test]
async fn chat_turn_persists_and_cites_sources() {
    let store = fresh_store().await;
    let bus = SessionBus::new(Duration::from_secs(3600));
    let coordinator = coordinator(store.clone(), bus.clone());

    coordinator
        .ingest_document(
            "owner-a",
            Some("runbook"),
            "upload",
            ContentKind::Text,
            b"To restart the service, run systemctl restart ragcore on the host.",
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let llm: Arc<dyn LlmProvider> = Arc::new(EchoProvider { reply: "Run systemctl restart ragcore." });
    let orchestrator = ChatOrchestrator::new(
        store.clone(),
        disabled_embedder(),
        None,
        llm,
        bus,
        Default::default(),
        Default::default(),
        Default::default(),
    );

    let request = ChatRequest {
        owner_id: "owner-a".to_string(),
        session_id: "session-1".to_string(),
        conversation_id: None,
        user_message: "How do I restart the service?".to_string(),
        model_id: "echo".to_string(),
        temperature: 0.0,
        top_k: 5,
        use_rag: true,
        use_reranker: false,
        use_hybrid: true,
        use_query_expansion: false,
        use_corrective: false,
        prompt_template: PromptTemplate::CitationFirst,
        use_expert_system_prompt: false,
        custom_system_prompt: None,
    };

    use futures_util::StreamExt;
    let mut stream = orchestrator.generate_answer(request, CancellationToken::new()).await.unwrap();
    let mut full_reply = String::new();
    while let Some(token) = stream.next().await {
        full_reply.push_str(&token.unwrap());
    }
    assert!(full_reply.contains("systemctl restart"));
}

/// Cancelling the stream mid-flight stops delivery and the orchestrator
/// surfaces a `Cancelled` error rather than hanging or panicking (spec §8
/// scenario 4).
#[tokio::test]
async fn cancellation_mid_stream_is_surfaced() {
    struct HangingProvider;

    #[async_trait]
    impl LlmProvider for HangingProvider {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<String> {
            Ok(String::new())
        }

        async fn generate_stream(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
            cancellation_token: CancellationToken,
        ) -> Result<TokenStream> {
            let stream = async_stream::stream! {
                yield Ok("partial".to_string());
                cancellation_token.cancelled().await;
                yield Err(RagError::Cancelled { correlation_id: "session-cancel".to_string() });
            };
            Ok(Box::pin(stream))
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn health_check(&self) -> HealthStatus {
            HealthStatus::Healthy
        }

        fn name(&self) -> &'static str {
            "hanging"
        }
    }

    let store = fresh_store().await;
    let bus = SessionBus::new(Duration::from_secs(3600));
    let llm: Arc<dyn LlmProvider> = Arc::new(HangingProvider);
    let orchestrator = ChatOrchestrator::new(
        store,
        disabled_embedder(),
        None,
        llm,
        bus,
        Default::default(),
        Default::default(),
        Default::default(),
    );

    let token = CancellationToken::new();
    let request = ChatRequest {
        owner_id: "owner-a".to_string(),
        session_id: "session-cancel".to_string(),
        conversation_id: None,
        user_message: "tell me a long story".to_string(),
        model_id: "echo".to_string(),
        temperature: 0.0,
        top_k: 5,
        use_rag: false,
        use_reranker: false,
        use_hybrid: false,
        use_query_expansion: false,
        use_corrective: false,
        prompt_template: PromptTemplate::CitationFirst,
        use_expert_system_prompt: false,
        custom_system_prompt: None,
    };

    use futures_util::StreamExt;
    let mut stream = orchestrator.generate_answer(request, token.clone()).await.unwrap();
    let first = stream.next().await.unwrap();
    assert_eq!(first.unwrap(), "partial");
    token.cancel();
    let second = stream.next().await.unwrap();
    assert!(matches!(second, Err(RagError::Cancelled { .. })));
}
