//! Corrective Gate (C8) — scores retrieved candidates for relevance and
//! triggers a single bounded retrieval re-trial when coverage is thin, per
//! §4.8.
//!
//! The per-candidate scoring prompt and the "union both passes, re-rerank"
//! recovery strategy mirror the teacher's retry-with-broadened-parameters
//! idiom already used by [`crate::embedder`]'s adaptive batch controller,
//! generalized here from a batch-size ladder to a retrieval-width ladder.

use async_trait::async_trait;

use crate::config::CorrectiveRagConfig;
use crate::error::Result;
use crate::llm::{GenerateOptions, LlmProvider};
use crate::models::RetrievalResult;
use crate::rerank::Reranker;
use crate::retrieval::HybridRetriever;
use crate::store::SearchFilters;

/// Hook for an external (web) search adapter, per §4.8's "well-defined hook"
/// note. `enable_external_search` defaults to `false`; no implementation
/// ships in this crate, preserving the local-first contract.
#[async_trait]
pub trait ExternalSearchAdapter: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<RetrievalResult>>;
}

/// Outcome of a gate evaluation, surfaced to callers (e.g. the Chat
/// Orchestrator) that want to log or report whether a re-trial happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Fewer than `min_relevant` candidates scored high enough, and a
    /// re-trial was run (successfully or not — gate failures degrade to
    /// the original candidates, see [`GateOutcome::GateFailed`]).
    Retried,
    /// The first pass already had enough relevant candidates.
    Accepted,
    /// Evaluation itself failed (LLM error, timeout, malformed response);
    /// the original ungated candidates are returned unchanged.
    GateFailed,
}

/// Runs the Corrective Gate's evaluate/re-trial decision over one set of
/// Hybrid Retriever candidates.
pub struct CorrectiveGate<'a> {
    retriever: &'a HybridRetriever<'a>,
    reranker: Option<&'a Reranker>,
    config: CorrectiveRagConfig,
}

impl<'a> CorrectiveGate<'a> {
    pub fn new(retriever: &'a HybridRetriever<'a>, reranker: Option<&'a Reranker>, config: CorrectiveRagConfig) -> Self {
        Self { retriever, reranker, config }
    }

    /// Evaluates `candidates` (the Hybrid Retriever's — optionally
    /// reranked — output) and, if under-supplied, re-trials retrieval with
    /// doubled candidate caps, returning the union of both passes
    /// (re-reranked if a reranker was supplied). At most one re-trial ever
    /// runs per call.
    pub async fn evaluate(
        &self,
        provider: &dyn LlmProvider,
        owner_id: &str,
        queries: &[String],
        candidates: Vec<RetrievalResult>,
        filters: Option<&SearchFilters>,
        k_vec: i64,
        k_lex: i64,
        top_k: usize,
    ) -> (Vec<RetrievalResult>, GateOutcome) {
        if candidates.is_empty() {
            return (candidates, GateOutcome::Accepted);
        }

        let scores = match self.score_candidates(provider, &queries[0], &candidates).await {
            Ok(scores) => scores,
            Err(e) => {
                tracing::warn!(error = %e, "corrective gate evaluation failed, using ungated retrieval result");
                return (candidates, GateOutcome::GateFailed);
            }
        };

        let relevant_count = scores.iter().filter(|&&s| s >= self.config.relevance_threshold).count();
        if relevant_count >= self.config.min_relevant {
            return (candidates, GateOutcome::Accepted);
        }

        let retrial = self
            .retriever
            .retrieve_with_k(owner_id, queries, true, filters, k_vec * 2, k_lex * 2)
            .await;

        let mut union = candidates;
        match retrial {
            Ok(second_pass) => {
                for result in second_pass {
                    if !union.iter().any(|c| c.chunk_id == result.chunk_id) {
                        union.push(result);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "corrective gate re-trial failed, keeping first-pass candidates");
            }
        }

        let merged = if let Some(reranker) = self.reranker {
            reranker.rerank(&queries[0], union, top_k).await
        } else {
            let mut union = union;
            union.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            union.truncate(top_k);
            union
        };

        (merged, GateOutcome::Retried)
    }

    /// Sends one LLM prompt containing the query and every candidate's
    /// content, asking for a per-candidate integer score in `0..=10`.
    /// Parses a newline-delimited `index: score` response; any parse
    /// failure propagates as an error, degrading the whole gate per
    /// [`GateOutcome::GateFailed`].
    async fn score_candidates(&self, provider: &dyn LlmProvider, query: &str, candidates: &[RetrievalResult]) -> Result<Vec<u8>> {
        let prompt = build_scoring_prompt(query, candidates);
        let options = GenerateOptions {
            model_id: "default".to_string(),
            temperature: 0.0,
            max_tokens: Some(512),
            stop_sequences: Vec::new(),
            top_p: None,
        };

        let response = tokio::time::timeout(
            std::time::Duration::from_secs(self.config.timeout_secs),
            provider.generate(&prompt, &options),
        )
        .await
        .map_err(|_| crate::error::RagError::retrieval_failed("corrective gate scoring timed out"))??;

        parse_scores(&response, candidates.len())
    }
}

fn build_scoring_prompt(query: &str, candidates: &[RetrievalResult]) -> String {
    let mut prompt = format!(
        "Query: \"{query}\"\n\nFor each numbered passage below, respond on its own line as \
         \"INDEX: SCORE\" where SCORE is an integer from 0 (irrelevant) to 10 (directly answers \
         the query). Output nothing else.\n\n"
    );
    for (i, candidate) in candidates.iter().enumerate() {
        prompt.push_str(&format!("[{i}] {}\n\n", candidate.content));
    }
    prompt
}

/// Parses `"INDEX: SCORE"` lines into a dense `Vec<u8>` aligned with the
/// original candidate order. Missing indices default to `0` (treated as
/// irrelevant) rather than failing the whole gate on a partial response.
fn parse_scores(response: &str, expected_len: usize) -> Result<Vec<u8>> {
    let mut scores = vec![0u8; expected_len];
    let mut any_parsed = false;

    for line in response.lines() {
        let line = line.trim().trim_start_matches(['[', '(']).trim_end_matches([']', ')']);
        let Some((idx_part, score_part)) = line.split_once(':') else { continue };
        let Ok(idx) = idx_part.trim().parse::<usize>() else { continue };
        let Ok(score) = score_part.trim().parse::<i64>() else { continue };
        if idx < expected_len {
            scores[idx] = score.clamp(0, 10) as u8;
            any_parsed = true;
        }
    }

    if !any_parsed {
        return Err(crate::error::RagError::retrieval_failed("corrective gate response could not be parsed"));
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scores_reads_index_score_pairs() {
        let response = "[0]: 8\n[1]: 2\n[2]: 9";
        let scores = parse_scores(response, 3).unwrap();
        assert_eq!(scores, vec![8, 2, 9]);
    }

    #[test]
    fn parse_scores_defaults_missing_indices_to_zero() {
        let response = "0: 9";
        let scores = parse_scores(response, 3).unwrap();
        assert_eq!(scores, vec![9, 0, 0]);
    }

    #[test]
    fn parse_scores_clamps_out_of_range_values() {
        let response = "0: 55\n1: -3";
        let scores = parse_scores(response, 2).unwrap();
        assert_eq!(scores, vec![10, 0]);
    }

    #[test]
    fn parse_scores_errors_on_totally_unparseable_response() {
        let response = "I cannot help with that request.";
        let result = parse_scores(response, 2);
        assert!(result.is_err());
    }

    #[test]
    fn build_scoring_prompt_includes_query_and_every_candidate() {
        let candidates = vec![RetrievalResult {
            chunk_id: "c1".to_string(),
            document_id: "d1".to_string(),
            document_title: None,
            section_path: vec![],
            content: "alpha content".to_string(),
            score: 0.5,
            vector_score: None,
            lexical_score: None,
            rerank_score: None,
        }];
        let prompt = build_scoring_prompt("find alpha", &candidates);
        assert!(prompt.contains("find alpha"));
        assert!(prompt.contains("alpha content"));
    }
}
