//! Chat Orchestrator (C9) — the end-to-end turn pipeline: persist the user
//! message, pull short-term memory, optionally retrieve and gate context,
//! assemble a prompt, stream the answer, and finalize with metadata, per
//! §4.9.
//!
//! The streaming path reuses `llm.rs`'s `async_stream::stream!` idiom:
//! tokens are both yielded to the immediate caller and relayed to the
//! Session Bus's `chat/{session_id}/stream` topic, so a detached subscriber
//! (e.g. a future HTTP/WS front end) observes the same turn without holding
//! the returned stream itself.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{CorrectiveRagConfig, QueryExpansionConfig, RetrievalConfig};
use crate::corrective::{CorrectiveGate, GateOutcome};
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::expand;
use crate::llm::{GenerateOptions, LlmProvider, TokenStream};
use crate::models::{Message, MessageMetadata, MessageRole, MessageSource, RetrievalResult};
use crate::rerank::Reranker;
use crate::retrieval::HybridRetriever;
use crate::session::{chat_stream_topic, SessionBus};
use crate::store::Store;

/// Number of most-recent turns folded into the prompt as short-term memory.
const SHORT_TERM_MEMORY_TURNS: i64 = 10;
/// Bounded retries on a store write during stream finalization, per §7's
/// "Store failure during finalization" recovery policy.
const FINALIZE_WRITE_ATTEMPTS: u32 = 3;

/// Selects a built-in system prompt. Superseded entirely by
/// `ChatRequest::custom_system_prompt` when that field is `Some`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptTemplate {
    Expert,
    #[default]
    CitationFirst,
    ChainOfThought,
    ExtractiveQa,
}

const EXPERT_SYSTEM_PROMPT: &str = "You are a domain expert assistant. Answer precisely and technically, drawing on the provided context where it is relevant. If the context does not contain the answer, say so rather than guessing.";
const CITATION_FIRST_SYSTEM_PROMPT: &str = "You are a retrieval-augmented assistant. Answer using only the numbered context passages below, and cite the passage number(s) supporting each claim, e.g. \"[2]\". If the passages do not answer the question, say you don't have enough information.";
const CHAIN_OF_THOUGHT_SYSTEM_PROMPT: &str = "You are a careful reasoning assistant. Think through the question step by step using the provided context, then give a concise final answer.";
const EXTRACTIVE_QA_SYSTEM_PROMPT: &str = "You answer strictly by extracting the relevant span(s) from the provided context verbatim. Do not add information that is not present in the context.";

/// One chat turn's inputs, per §4.9's field list.
///
/// Field-overlap resolution (no part of the spec's prose disambiguates this,
/// see DESIGN.md Open Question resolution 4): `custom_system_prompt`, when
/// set, wins outright. Otherwise `use_expert_system_prompt` is a convenience
/// override that forces [`PromptTemplate::Expert`] regardless of
/// `prompt_template` — it exists for callers that only want a binary choice
/// without naming the other three templates.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub owner_id: String,
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub user_message: String,
    pub model_id: String,
    pub temperature: f32,
    pub top_k: usize,
    pub use_rag: bool,
    pub use_reranker: bool,
    pub use_hybrid: bool,
    pub use_query_expansion: bool,
    pub use_corrective: bool,
    pub prompt_template: PromptTemplate,
    pub use_expert_system_prompt: bool,
    pub custom_system_prompt: Option<String>,
}

fn system_prompt(request: &ChatRequest) -> String {
    if let Some(custom) = &request.custom_system_prompt {
        return custom.clone();
    }
    let template = if request.use_expert_system_prompt {
        PromptTemplate::Expert
    } else {
        request.prompt_template
    };
    match template {
        PromptTemplate::Expert => EXPERT_SYSTEM_PROMPT.to_string(),
        PromptTemplate::CitationFirst => CITATION_FIRST_SYSTEM_PROMPT.to_string(),
        PromptTemplate::ChainOfThought => CHAIN_OF_THOUGHT_SYSTEM_PROMPT.to_string(),
        PromptTemplate::ExtractiveQa => EXTRACTIVE_QA_SYSTEM_PROMPT.to_string(),
    }
}

/// Events relayed to `chat/{session_id}/stream`, per §6's external wire
/// shapes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ChatEvent {
    Token { text: String },
    Sources { sources: Vec<MessageSource> },
    Done { metadata: MessageMetadata },
    Error { message: String },
}

/// Published to the same topic when a stream ends for any reason, so a
/// subscriber waiting on completion does not have to infer it from the
/// absence of further tokens.
#[derive(Debug, Clone, Serialize)]
struct StreamEnded {
    session_id: String,
    reason: String,
}

fn publish_event(bus: &SessionBus, topic: &str, event: &impl Serialize) {
    if let Ok(payload) = serde_json::to_string(event) {
        bus.publish(topic, payload);
    }
}

/// Drives the full chat pipeline for one crate instance. Cheap to clone;
/// every clone shares the same store, model resources, and bus.
#[derive(Clone)]
pub struct ChatOrchestrator {
    store: Arc<dyn Store>,
    embedder: Embedder,
    reranker: Option<Arc<Reranker>>,
    llm: Arc<dyn LlmProvider>,
    bus: SessionBus,
    retrieval_config: RetrievalConfig,
    query_expansion_config: QueryExpansionConfig,
    corrective_config: CorrectiveRagConfig,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Embedder,
        reranker: Option<Arc<Reranker>>,
        llm: Arc<dyn LlmProvider>,
        bus: SessionBus,
        retrieval_config: RetrievalConfig,
        query_expansion_config: QueryExpansionConfig,
        corrective_config: CorrectiveRagConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            reranker,
            llm,
            bus,
            retrieval_config,
            query_expansion_config,
            corrective_config,
        }
    }

    /// Runs one turn: persists `request.user_message`, retrieves context if
    /// `request.use_rag`, streams the answer, and finalizes the assistant
    /// message on completion, cancellation, or provider failure.
    pub async fn generate_answer(&self, request: ChatRequest, cancellation_token: CancellationToken) -> Result<TokenStream> {
        self.run(request, cancellation_token, true).await
    }

    /// Locates the user message preceding `assistant_message_id`, deletes
    /// the old assistant message, and re-runs the pipeline from that user
    /// message without persisting it again, per §4.9.
    pub async fn regenerate_answer(
        &self,
        assistant_message_id: &str,
        mut request: ChatRequest,
        cancellation_token: CancellationToken,
    ) -> Result<TokenStream> {
        let conversation_id = request
            .conversation_id
            .clone()
            .ok_or_else(|| RagError::invalid("regenerate_answer requires conversation_id"))?;

        let recent = self.store.list_messages(&conversation_id, None, 100).await?;
        let idx = recent
            .iter()
            .position(|m| m.id == assistant_message_id)
            .ok_or_else(|| RagError::invalid(format!("assistant message not found: {assistant_message_id}")))?;
        let preceding_user = recent[idx + 1..]
            .iter()
            .find(|m| m.role == MessageRole::User)
            .ok_or_else(|| RagError::invalid("no preceding user message to regenerate from"))?;

        request.user_message = preceding_user.content.clone();
        self.store.delete_message(assistant_message_id).await?;

        self.run(request, cancellation_token, false).await
    }

    async fn run(&self, request: ChatRequest, cancellation_token: CancellationToken, persist_user_message: bool) -> Result<TokenStream> {
        let start = Instant::now();

        let conversation_id = match &request.conversation_id {
            Some(id) => id.clone(),
            None => self.store.create_conversation(&request.owner_id, None).await?.id,
        };
        self.bus.set_conversation(&request.session_id, &conversation_id);

        if persist_user_message {
            self.store
                .append_message(&conversation_id, MessageRole::User, &request.user_message, MessageMetadata::default())
                .await?;
        }

        let mut history = self
            .store
            .list_messages(&conversation_id, None, SHORT_TERM_MEMORY_TURNS + 1)
            .await?;
        history.reverse();
        if persist_user_message {
            // Drop the turn just persisted above; it is rendered explicitly
            // as the trailing "user:" line by `build_prompt` instead.
            history.pop();
        }

        let (context, sources) = if request.use_rag {
            self.retrieve_context(&request).await
        } else {
            (Vec::new(), Vec::new())
        };

        let prompt = build_prompt(&request, &history, &context);
        let topic = chat_stream_topic(&request.session_id);
        publish_event(&self.bus, &topic, &ChatEvent::Sources { sources: sources.clone() });

        let options = GenerateOptions {
            model_id: request.model_id.clone(),
            temperature: request.temperature,
            max_tokens: None,
            stop_sequences: Vec::new(),
            top_p: None,
        };
        let inner = self.llm.generate_stream(&prompt, &options, cancellation_token.clone()).await?;

        let store = self.store.clone();
        let bus = self.bus.clone();
        let session_id = request.session_id.clone();
        let model_id = request.model_id.clone();

        let stream = async_stream::stream! {
            tokio::pin!(inner);
            let mut full_text = String::new();
            let mut token_count: u32 = 0;
            let mut cancelled = false;
            let mut failure: Option<String> = None;

            loop {
                match inner.next().await {
                    Some(Ok(text)) => {
                        full_text.push_str(&text);
                        token_count += 1;
                        publish_event(&bus, &topic, &ChatEvent::Token { text: text.clone() });
                        yield Ok(text);
                    }
                    Some(Err(RagError::Cancelled { .. })) => {
                        cancelled = true;
                        break;
                    }
                    Some(Err(e)) => {
                        failure = Some(e.to_string());
                        break;
                    }
                    None => break,
                }
            }

            let metadata = MessageMetadata {
                model_id: Some(model_id),
                sources,
                response_time_ms: Some(start.elapsed().as_millis() as u64),
                token_count: Some(token_count),
                partial: (cancelled || failure.is_some()).then_some(true),
                error: failure.clone(),
            };

            let mut attempts = 0u32;
            loop {
                match store.append_message(&conversation_id, MessageRole::Assistant, &full_text, metadata.clone()).await {
                    Ok(_) => break,
                    Err(e) if e.is_retryable() && attempts + 1 < FINALIZE_WRITE_ATTEMPTS => {
                        attempts += 1;
                        tracing::warn!(error = %e, attempts, "retrying assistant message finalization write");
                        tokio::time::sleep(std::time::Duration::from_millis(50 * 2u64.pow(attempts))).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to persist assistant message after retries");
                        break;
                    }
                }
            }

            if cancelled {
                publish_event(&bus, &topic, &StreamEnded { session_id: session_id.clone(), reason: "cancelled".to_string() });
                yield Err(RagError::Cancelled { correlation_id: session_id });
            } else if let Some(message) = failure {
                publish_event(&bus, &topic, &ChatEvent::Error { message: message.clone() });
                publish_event(&bus, &topic, &StreamEnded { session_id: session_id.clone(), reason: "error".to_string() });
                yield Err(RagError::provider("chat", message));
            } else {
                publish_event(&bus, &topic, &ChatEvent::Done { metadata });
                publish_event(&bus, &topic, &StreamEnded { session_id, reason: "completed".to_string() });
            }
        };

        Ok(Box::pin(stream))
    }

    /// Runs expansion (if enabled), hybrid retrieval, reranking (if
    /// enabled), and the Corrective Gate (if enabled) for one turn. Any
    /// stage failure degrades to fewer/no sources rather than failing the
    /// whole turn, per §7's "answer without context" user-visible behavior.
    async fn retrieve_context(&self, request: &ChatRequest) -> (Vec<RetrievalResult>, Vec<MessageSource>) {
        let queries = if request.use_query_expansion {
            expand::expand(self.llm.as_ref(), &request.user_message, &self.query_expansion_config).await
        } else {
            vec![request.user_message.clone()]
        };

        let retriever = HybridRetriever::new(self.store.as_ref(), &self.embedder, self.retrieval_config.clone());
        let candidates = match retriever.retrieve(&request.owner_id, &queries, request.use_hybrid, None).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(error = %e, session_id = %request.session_id, "retrieval failed, answering without context");
                return (Vec::new(), Vec::new());
            }
        };

        let reranked = if request.use_reranker {
            if let Some(reranker) = &self.reranker {
                reranker.rerank(&request.user_message, candidates, request.top_k).await
            } else {
                let mut candidates = candidates;
                candidates.truncate(request.top_k);
                candidates
            }
        } else {
            let mut candidates = candidates;
            candidates.truncate(request.top_k);
            candidates
        };

        let final_candidates = if request.use_corrective {
            let gate = CorrectiveGate::new(&retriever, self.reranker.as_deref(), self.corrective_config.clone());
            let (gated, outcome) = gate
                .evaluate(
                    self.llm.as_ref(),
                    &request.owner_id,
                    &queries,
                    reranked,
                    None,
                    self.retrieval_config.k_vec,
                    self.retrieval_config.k_lex,
                    request.top_k,
                )
                .await;
            if outcome == GateOutcome::Retried {
                tracing::info!(session_id = %request.session_id, "corrective gate widened retrieval for this turn");
            }
            gated
        } else {
            reranked
        };

        let sources = final_candidates
            .iter()
            .map(|c| MessageSource {
                chunk_id: c.chunk_id.clone(),
                document_title: c.document_title.clone(),
                section: c.section_path.last().cloned(),
                similarity: c.score,
            })
            .collect();

        (final_candidates, sources)
    }
}

/// Assembles the single flat prompt handed to [`LlmProvider::generate_stream`]:
/// system prompt, numbered context passages, prior turns, then the current
/// user message.
fn build_prompt(request: &ChatRequest, history: &[Message], context: &[RetrievalResult]) -> String {
    let mut prompt = system_prompt(request);
    prompt.push_str("\n\n");

    if !context.is_empty() {
        prompt.push_str("Context:\n");
        for (i, passage) in context.iter().enumerate() {
            let title = passage.document_title.as_deref().unwrap_or("untitled");
            prompt.push_str(&format!(
                "[{}] {} ({:.0}% relevant)\n{}\n",
                i + 1,
                title,
                passage.score * 100.0,
                passage.content
            ));
        }
        prompt.push('\n');
    }

    if !history.is_empty() {
        prompt.push_str("Conversation so far:\n");
        for message in history {
            prompt.push_str(&format!("{}: {}\n", message.role.as_str(), message.content));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!("user: {}\nassistant:", request.user_message));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::llm::HealthStatus;
    use crate::migrate::run_migrations;
    use crate::store::SqlStore;
    use async_trait::async_trait;

    struct StubProvider {
        tokens: Vec<&'static str>,
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<String> {
            Ok(self.tokens.concat())
        }

        async fn generate_stream(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
            _cancellation_token: CancellationToken,
        ) -> Result<TokenStream> {
            let items: Vec<Result<String>> = self.tokens.iter().map(|t| Ok(t.to_string())).collect();
            Ok(Box::pin(futures_util::stream::iter(items)))
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn health_check(&self) -> HealthStatus {
            HealthStatus::Healthy
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    struct CancellingProvider;

    #[async_trait]
    impl LlmProvider for CancellingProvider {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<String> {
            Ok(String::new())
        }

        async fn generate_stream(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
            _cancellation_token: CancellationToken,
        ) -> Result<TokenStream> {
            let items: Vec<Result<String>> = vec![
                Ok("partial answer".to_string()),
                Err(RagError::Cancelled { correlation_id: "stream".to_string() }),
            ];
            Ok(Box::pin(futures_util::stream::iter(items)))
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn health_check(&self) -> HealthStatus {
            HealthStatus::Healthy
        }

        fn name(&self) -> &'static str {
            "cancelling"
        }
    }

    async fn test_orchestrator(llm: Arc<dyn LlmProvider>) -> (ChatOrchestrator, SessionBus) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(SqlStore::new(pool));
        let embedder = Embedder::new(EmbeddingConfig { provider: "disabled".to_string(), ..EmbeddingConfig::default() });
        let bus = SessionBus::new(std::time::Duration::from_secs(3600));
        let orchestrator = ChatOrchestrator::new(
            store,
            embedder,
            None,
            llm,
            bus.clone(),
            RetrievalConfig::default(),
            QueryExpansionConfig::default(),
            CorrectiveRagConfig::default(),
        );
        (orchestrator, bus)
    }

    fn request(session_id: &str) -> ChatRequest {
        ChatRequest {
            owner_id: "owner-1".to_string(),
            session_id: session_id.to_string(),
            conversation_id: None,
            user_message: "what is the capital of France?".to_string(),
            model_id: "default".to_string(),
            temperature: 0.7,
            top_k: 5,
            use_rag: false,
            use_reranker: false,
            use_hybrid: false,
            use_query_expansion: false,
            use_corrective: false,
            prompt_template: PromptTemplate::CitationFirst,
            use_expert_system_prompt: false,
            custom_system_prompt: None,
        }
    }

    #[tokio::test]
    async fn generate_answer_streams_tokens_and_persists_assistant_message() {
        let provider = Arc::new(StubProvider { tokens: vec!["Paris", " is", " the capital."] });
        let (orchestrator, _bus) = test_orchestrator(provider).await;

        let stream = orchestrator.generate_answer(request("s1"), CancellationToken::new()).await.unwrap();
        let tokens: Vec<String> = stream.filter_map(|r| async move { r.ok() }).collect().await;
        assert_eq!(tokens.join(""), "Paris is the capital.");
    }

    #[tokio::test]
    async fn without_rag_no_context_block_is_built() {
        let provider = Arc::new(StubProvider { tokens: vec!["ok"] });
        let (orchestrator, _bus) = test_orchestrator(provider).await;
        let req = request("s2");

        let stream = orchestrator.generate_answer(req, CancellationToken::new()).await.unwrap();
        let _: Vec<_> = stream.collect().await;
    }

    #[tokio::test]
    async fn done_event_carries_metadata_on_the_session_topic() {
        let provider = Arc::new(StubProvider { tokens: vec!["hi"] });
        let (orchestrator, bus) = test_orchestrator(provider).await;
        let topic = chat_stream_topic("s3");
        let mut rx = bus.subscribe(&topic);

        let mut req = request("s3");
        req.conversation_id = None;
        let stream = orchestrator.generate_answer(req, CancellationToken::new()).await.unwrap();
        let _: Vec<_> = stream.collect().await;

        let mut saw_done = false;
        while let Ok(payload) = rx.try_recv() {
            if payload.contains("\"type\":\"done\"") {
                saw_done = true;
            }
        }
        assert!(saw_done);
    }

    #[tokio::test]
    async fn cancellation_persists_partial_message_and_emits_stream_ended() {
        let (orchestrator, bus) = test_orchestrator(Arc::new(CancellingProvider)).await;
        let topic = chat_stream_topic("s4");
        let mut rx = bus.subscribe(&topic);

        let req = request("s4");
        let conversation_id = orchestrator.store.create_conversation("owner-1", None).await.unwrap().id;
        let mut req = req;
        req.conversation_id = Some(conversation_id.clone());

        let stream = orchestrator.generate_answer(req, CancellationToken::new()).await.unwrap();
        let results: Vec<Result<String>> = stream.collect().await;
        assert!(results.last().unwrap().is_err());

        let messages = orchestrator.store.list_messages(&conversation_id, None, 10).await.unwrap();
        let assistant = messages.iter().find(|m| m.role == MessageRole::Assistant).unwrap();
        assert_eq!(assistant.content, "partial answer");
        assert_eq!(assistant.metadata.partial, Some(true));

        let mut saw_ended = false;
        while let Ok(payload) = rx.try_recv() {
            if payload.contains("cancelled") {
                saw_ended = true;
            }
        }
        assert!(saw_ended);
    }

    #[tokio::test]
    async fn regenerate_answer_deletes_old_assistant_message_and_reruns() {
        let provider = Arc::new(StubProvider { tokens: vec!["new answer"] });
        let (orchestrator, _bus) = test_orchestrator(provider).await;

        let conversation_id = orchestrator.store.create_conversation("owner-1", None).await.unwrap().id;
        orchestrator
            .store
            .append_message(&conversation_id, MessageRole::User, "original question", MessageMetadata::default())
            .await
            .unwrap();
        let old_assistant = orchestrator
            .store
            .append_message(&conversation_id, MessageRole::Assistant, "stale answer", MessageMetadata::default())
            .await
            .unwrap();

        let mut req = request("s5");
        req.conversation_id = Some(conversation_id.clone());

        let stream = orchestrator
            .regenerate_answer(&old_assistant.id, req, CancellationToken::new())
            .await
            .unwrap();
        let _: Vec<_> = stream.collect().await;

        let messages = orchestrator.store.list_messages(&conversation_id, None, 10).await.unwrap();
        assert!(messages.iter().all(|m| m.id != old_assistant.id));
        let newest_assistant = messages.iter().find(|m| m.role == MessageRole::Assistant).unwrap();
        assert_eq!(newest_assistant.content, "new answer");
    }

    #[test]
    fn custom_system_prompt_overrides_everything() {
        let mut req = request("s6");
        req.custom_system_prompt = Some("be terse".to_string());
        req.use_expert_system_prompt = true;
        req.prompt_template = PromptTemplate::ExtractiveQa;
        assert_eq!(system_prompt(&req), "be terse");
    }

    #[test]
    fn use_expert_flag_overrides_prompt_template_when_no_custom_prompt() {
        let mut req = request("s7");
        req.use_expert_system_prompt = true;
        req.prompt_template = PromptTemplate::ExtractiveQa;
        assert_eq!(system_prompt(&req), EXPERT_SYSTEM_PROMPT);
    }

    #[test]
    fn prompt_template_selects_built_in_template_when_no_overrides() {
        let mut req = request("s8");
        req.prompt_template = PromptTemplate::ChainOfThought;
        assert_eq!(system_prompt(&req), CHAIN_OF_THOUGHT_SYSTEM_PROMPT);
    }

    #[test]
    fn build_prompt_includes_context_history_and_trailing_user_turn() {
        let req = request("s9");
        let history = vec![Message {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            role: MessageRole::User,
            content: "earlier turn".to_string(),
            created_at: chrono::Utc::now(),
            metadata: MessageMetadata::default(),
        }];
        let context = vec![RetrievalResult {
            chunk_id: "c1".to_string(),
            document_id: "d1".to_string(),
            document_title: None,
            section_path: vec![],
            content: "Paris is the capital of France.".to_string(),
            score: 0.9,
            vector_score: None,
            lexical_score: None,
            rerank_score: None,
        }];
        let prompt = build_prompt(&req, &history, &context);
        assert!(prompt.contains("Paris is the capital of France."));
        assert!(prompt.contains("earlier turn"));
        assert!(prompt.ends_with("user: what is the capital of France?\nassistant:"));
    }
}
