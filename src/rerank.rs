//! Reranker (C6) — cross-encoder reordering of the Hybrid Retriever's
//! top candidates, per §4.6.
//!
//! Shares the Embedder's scoped-resource discipline (load/unload, idle
//! timeout) via [`crate::embedder`]'s pattern, but reranking uses fastembed's
//! text-reranking pipeline rather than a dense-embedding model, so it gets
//! its own lightweight wrapper instead of reusing `Embedder` directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::RerankerConfig;
use crate::error::{RagError, Result};
use crate::models::RetrievalResult;

/// Cross-encoder scorer, abstracted so tests can supply a deterministic
/// fake instead of loading a real reranking model.
pub trait CrossEncoder: Send + Sync {
    /// Scores each `(query, candidate_text)` pair; returns one real-valued
    /// logit per candidate, same order as input.
    fn score_pairs(&self, query: &str, candidates: &[&str]) -> Result<Vec<f32>>;
}

#[cfg(feature = "local-embeddings-fastembed")]
pub struct FastembedCrossEncoder {
    model: fastembed::TextRerank,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl FastembedCrossEncoder {
    pub fn new(model_name: &str) -> Result<Self> {
        let model = match model_name {
            "bge-reranker-base" => fastembed::RerankerModel::BGERerankerBase,
            other => {
                return Err(RagError::model_unavailable(format!(
                    "unknown reranker model: '{other}'"
                )))
            }
        };
        let inner = fastembed::TextRerank::try_new(fastembed::RerankInitOptions::new(model))
            .map_err(|e| RagError::model_unavailable(format!("failed to load reranker: {e}")))?;
        Ok(Self { model: inner })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl CrossEncoder for FastembedCrossEncoder {
    fn score_pairs(&self, query: &str, candidates: &[&str]) -> Result<Vec<f32>> {
        let results = self
            .model
            .rerank(query, candidates.to_vec(), false, None)
            .map_err(|e| RagError::model_unavailable(format!("rerank failed: {e}")))?;
        let mut scores = vec![0.0f32; candidates.len()];
        for r in results {
            if let Some(slot) = scores.get_mut(r.index) {
                *slot = r.score;
            }
        }
        Ok(scores)
    }
}

struct LoadedEncoder {
    encoder: Arc<dyn CrossEncoder>,
    last_used: Instant,
}

/// Scoped reranker resource: lazily loads a [`CrossEncoder`], auto-unloads
/// after `idle_timeout_s`, and processes candidates in mini-batches.
pub struct Reranker {
    config: RerankerConfig,
    factory: Box<dyn Fn() -> Result<Arc<dyn CrossEncoder>> + Send + Sync>,
    slot: Arc<Mutex<Option<LoadedEncoder>>>,
}

impl Reranker {
    pub fn new(config: RerankerConfig, factory: Box<dyn Fn() -> Result<Arc<dyn CrossEncoder>> + Send + Sync>) -> Self {
        Self { config, factory, slot: Arc::new(Mutex::new(None)) }
    }

    pub async fn unload(&self) {
        *self.slot.lock().await = None;
    }

    pub async fn idle_tick(&self, idle_timeout: Duration) {
        let mut guard = self.slot.lock().await;
        if let Some(model) = guard.as_ref() {
            if model.last_used.elapsed() >= idle_timeout {
                *guard = None;
            }
        }
    }

    /// Reranks `candidates` against `query`, replacing each candidate's
    /// fused score with the cross-encoder's normalized score, truncated to
    /// `top_k`. A loader failure is non-fatal: the pre-rerank ordering is
    /// returned, truncated, per §4.6's failure semantics.
    pub async fn rerank(&self, query: &str, candidates: Vec<RetrievalResult>, top_k: usize) -> Vec<RetrievalResult> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let encoder = match self.acquire().await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "reranker unavailable, falling back to pre-rerank ordering");
                let mut fallback = candidates;
                fallback.truncate(top_k);
                return fallback;
            }
        };

        let mut scored = Vec::with_capacity(candidates.len());
        for batch in candidates.chunks(self.config.batch_size) {
            let texts: Vec<&str> = batch.iter().map(|c| c.content.as_str()).collect();
            match encoder.score_pairs(query, &texts) {
                Ok(logits) => {
                    for (candidate, logit) in batch.iter().zip(logits) {
                        let mut c = candidate.clone();
                        c.rerank_score = Some(logit);
                        c.score = sigmoid(logit);
                        scored.push(c);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reranker batch failed, keeping pre-rerank scores for this batch");
                    scored.extend(batch.iter().cloned());
                }
            }
        }

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    async fn acquire(&self) -> Result<Arc<dyn CrossEncoder>> {
        let mut guard = self.slot.lock().await;
        if guard.is_none() {
            let encoder = (self.factory)()?;
            *guard = Some(LoadedEncoder { encoder, last_used: Instant::now() });
        }
        let model = guard.as_mut().expect("just populated");
        model.last_used = Instant::now();
        Ok(model.encoder.clone())
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEncoder(Vec<f32>);

    impl CrossEncoder for FixedEncoder {
        fn score_pairs(&self, _query: &str, candidates: &[&str]) -> Result<Vec<f32>> {
            Ok(self.0.iter().take(candidates.len()).cloned().collect())
        }
    }

    fn candidate(id: &str, score: f32) -> RetrievalResult {
        RetrievalResult {
            chunk_id: id.to_string(),
            document_id: "d1".to_string(),
            document_title: None,
            section_path: vec![],
            content: format!("content-{id}"),
            score,
            vector_score: None,
            lexical_score: None,
            rerank_score: None,
        }
    }

    fn reranker_with(scores: Vec<f32>) -> Reranker {
        let cfg = RerankerConfig { enabled: true, ..RerankerConfig::default() };
        Reranker::new(
            cfg,
            Box::new(move || Ok(Arc::new(FixedEncoder(scores.clone())) as Arc<dyn CrossEncoder>)),
        )
    }

    #[tokio::test]
    async fn empty_candidates_returns_empty() {
        let reranker = reranker_with(vec![]);
        let out = reranker.rerank("q", vec![], 10).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn reorders_by_cross_encoder_score() {
        let reranker = reranker_with(vec![-5.0, 5.0]);
        let candidates = vec![candidate("a", 0.9), candidate("b", 0.1)];
        let out = reranker.rerank("q", candidates, 10).await;
        assert_eq!(out[0].chunk_id, "b");
        assert_eq!(out[1].chunk_id, "a");
    }

    #[tokio::test]
    async fn truncates_to_top_k() {
        let reranker = reranker_with(vec![1.0, 2.0, 3.0]);
        let candidates = vec![candidate("a", 0.1), candidate("b", 0.2), candidate("c", 0.3)];
        let out = reranker.rerank("q", candidates, 2).await;
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn loader_failure_falls_back_to_pre_rerank_order() {
        let cfg = RerankerConfig { enabled: true, ..RerankerConfig::default() };
        let reranker = Reranker::new(cfg, Box::new(|| Err(RagError::model_unavailable("no model"))));
        let candidates = vec![candidate("a", 0.9), candidate("b", 0.1)];
        let out = reranker.rerank("q", candidates, 10).await;
        assert_eq!(out[0].chunk_id, "a");
        assert_eq!(out[1].chunk_id, "b");
    }
}
