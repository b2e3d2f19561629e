//! Hybrid Retriever (C5) — fuses dense-vector and sparse-lexical candidate
//! lists via Reciprocal Rank Fusion.
//!
//! Replaces the teacher's `search.rs` hybrid mode (linear min-max blend of
//! two already-ranked lists) with RRF over a rank-based fusion, per §4.5.
//! The min-max normalization step and the "fall back to single-stage when a
//! source is empty" policy are both carried over from the teacher's design.

use std::collections::HashMap;

use crate::config::RetrievalConfig;
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::models::RetrievalResult;
use crate::store::{ScoredChunk, SearchFilters, Store};

/// One (query variant, source) ranked list feeding RRF. Built internally;
/// not exposed outside this module.
struct RankedList {
    source: Source,
    /// chunk_id -> rank (0-indexed, best first)
    ranks: HashMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Vector,
    Lexical,
}

/// Runs candidate generation, RRF fusion, dedup, and normalization for one
/// (possibly expanded) query set against one owner's indexed content.
pub struct HybridRetriever<'a> {
    store: &'a dyn Store,
    embedder: &'a Embedder,
    config: RetrievalConfig,
}

impl<'a> HybridRetriever<'a> {
    pub fn new(store: &'a dyn Store, embedder: &'a Embedder, config: RetrievalConfig) -> Self {
        Self { store, embedder, config }
    }

    /// Retrieves the top `k_out` fused candidates for `queries` (the
    /// original query plus any expansion variants), scoped to `owner_id`.
    ///
    /// `use_hybrid = false` skips the lexical stage entirely — only vector
    /// candidates are fused (RRF over a single source degenerates to a
    /// rank-based reordering, still normalized to `[0, 1]`).
    pub async fn retrieve(
        &self,
        owner_id: &str,
        queries: &[String],
        use_hybrid: bool,
        filters: Option<&SearchFilters>,
    ) -> Result<Vec<RetrievalResult>> {
        self.retrieve_with_k(owner_id, queries, use_hybrid, filters, self.config.k_vec, self.config.k_lex)
            .await
    }

    /// Same as [`Self::retrieve`] but with explicit `k_vec`/`k_lex`, used by
    /// the Corrective Gate's re-trial (§4.8) to double the candidate caps.
    pub async fn retrieve_with_k(
        &self,
        owner_id: &str,
        queries: &[String],
        use_hybrid: bool,
        filters: Option<&SearchFilters>,
        k_vec: i64,
        k_lex: i64,
    ) -> Result<Vec<RetrievalResult>> {
        if queries.is_empty() {
            return Err(RagError::invalid("retrieve requires at least one query"));
        }

        let mut ranked_lists = Vec::new();
        let mut chunk_meta: HashMap<String, ScoredChunk> = HashMap::new();
        let mut vector_failed = false;
        let mut lexical_failed = false;

        for query in queries {
            match self.vector_candidates(owner_id, query, k_vec, filters).await {
                Ok(hits) => {
                    let mut ranks = HashMap::new();
                    for (rank, hit) in hits.iter().enumerate() {
                        ranks.insert(hit.chunk.id.clone(), rank);
                        chunk_meta.entry(hit.chunk.id.clone()).or_insert_with(|| hit.clone());
                    }
                    if !ranks.is_empty() {
                        ranked_lists.push(RankedList { source: Source::Vector, ranks });
                    }
                }
                Err(_) => vector_failed = true,
            }

            if use_hybrid {
                match self.store.lexical_search(owner_id, query, k_lex).await {
                    Ok(hits) => {
                        let mut ranks = HashMap::new();
                        for (rank, hit) in hits.iter().enumerate() {
                            ranks.insert(hit.chunk.id.clone(), rank);
                            chunk_meta.entry(hit.chunk.id.clone()).or_insert_with(|| hit.clone());
                        }
                        if !ranks.is_empty() {
                            ranked_lists.push(RankedList { source: Source::Lexical, ranks });
                        }
                    }
                    Err(_) => lexical_failed = true,
                }
            }
        }

        if ranked_lists.is_empty() {
            if vector_failed && (lexical_failed || !use_hybrid) {
                return Err(RagError::retrieval_failed("both vector and lexical stages failed"));
            }
            return Ok(Vec::new());
        }

        let fused = fuse_rrf(&ranked_lists, self.config.rrf_k, self.config.hybrid_weight);
        let normalized = normalize_unit(&fused);

        let mut results: Vec<RetrievalResult> = normalized
            .into_iter()
            .filter_map(|(chunk_id, score)| {
                chunk_meta.get(&chunk_id).map(|hit| RetrievalResult {
                    chunk_id: chunk_id.clone(),
                    document_id: hit.chunk.document_id.clone(),
                    document_title: hit.document_title.clone(),
                    section_path: hit.chunk.section_path.clone(),
                    content: hit.chunk.text.clone(),
                    score,
                    vector_score: None,
                    lexical_score: None,
                    rerank_score: None,
                })
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(self.config.k_out.max(0) as usize);
        Ok(results)
    }

    async fn vector_candidates(
        &self,
        owner_id: &str,
        query: &str,
        k: i64,
        filters: Option<&SearchFilters>,
    ) -> Result<Vec<ScoredChunk>> {
        let query_vec = self.embedder.encode_query(query).await?;
        self.store.vector_search(owner_id, &query_vec, k, filters).await
    }
}

/// Reciprocal Rank Fusion: `score(c) = Σ over lists L containing c of
/// weight(L.source) / (rrf_k + rank_L(c))`. `rank_L` is 0-indexed, so the
/// best-ranked item contributes `weight / rrf_k`, matching the `rank=1`
/// convention in the classic formula (`rrf_k + 1`).
fn fuse_rrf(lists: &[RankedList], rrf_k: f64, hybrid_weight: f64) -> HashMap<String, f64> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    for list in lists {
        let weight = match list.source {
            Source::Vector => hybrid_weight,
            Source::Lexical => 1.0 - hybrid_weight,
        };
        for (chunk_id, rank) in &list.ranks {
            let contribution = weight / (rrf_k + (*rank as f64 + 1.0));
            *scores.entry(chunk_id.clone()).or_insert(0.0) += contribution;
        }
    }
    scores
}

/// Min-max normalizes a fused-score map onto `[0, 1]`. A single candidate (or
/// all-equal scores) normalizes to `1.0`, matching the teacher's
/// `normalize_scores` convention in the old `search.rs`.
fn normalize_unit(scores: &HashMap<String, f64>) -> Vec<(String, f32)> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.values().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.values().cloned().fold(f64::NEG_INFINITY, f64::max);

    scores
        .iter()
        .map(|(id, &s)| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - min) / (max - min)
            };
            (id.clone(), norm as f32)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(source: Source, ids: &[&str]) -> RankedList {
        let ranks = ids.iter().enumerate().map(|(i, id)| (id.to_string(), i)).collect();
        RankedList { source, ranks }
    }

    #[test]
    fn fusion_rewards_chunks_appearing_in_both_lists() {
        let lists = vec![
            list(Source::Vector, &["a", "b", "c"]),
            list(Source::Lexical, &["b", "a", "d"]),
        ];
        let scores = fuse_rrf(&lists, 60.0, 0.7);
        assert!(scores["a"] > scores["c"]);
        assert!(scores["b"] > scores["c"]);
    }

    #[test]
    fn normalize_single_candidate_is_one() {
        let mut scores = HashMap::new();
        scores.insert("a".to_string(), 0.25);
        let normalized = normalize_unit(&scores);
        assert_eq!(normalized.len(), 1);
        assert!((normalized[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_preserves_relative_order() {
        let lists = vec![list(Source::Vector, &["a", "b", "c"])];
        let fused = fuse_rrf(&lists, 60.0, 0.7);
        let normalized = normalize_unit(&fused);
        let a = normalized.iter().find(|(id, _)| id == "a").unwrap().1;
        let c = normalized.iter().find(|(id, _)| id == "c").unwrap().1;
        assert!(a > c);
        for (_, score) in &normalized {
            assert!(*score >= 0.0 && *score <= 1.0);
        }
    }

    #[test]
    fn hybrid_weight_biases_vector_contribution() {
        let lists = vec![
            list(Source::Vector, &["a"]),
            list(Source::Lexical, &["b"]),
        ];
        let vector_favored = fuse_rrf(&lists, 60.0, 0.9);
        assert!(vector_favored["a"] > vector_favored["b"]);

        let lexical_favored = fuse_rrf(&lists, 60.0, 0.1);
        assert!(lexical_favored["b"] > lexical_favored["a"]);
    }
}
