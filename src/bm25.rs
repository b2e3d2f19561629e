//! Per-owner BM25 lexical index.
//!
//! The teacher relies solely on SQLite's built-in FTS5 `bm25()` ranking
//! function, which does not expose tunable `k1`/`b` per query. This module
//! is a hand-rolled term → posting-list index so the Hybrid Retriever can
//! score with the exact parameters §4.5 specifies. The scoring formula is
//! the classic Robertson/Sparck-Jones Okapi BM25 with lower-bound term
//! frequency normalization, following the same derivation used by the
//! `surrealdb` sibling repo's `idx::ft::scorer::BM25Scorer`.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Tunable BM25 parameters.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// One (chunk, term-frequency) posting for a single term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub chunk_id: String,
    pub term_frequency: u32,
}

/// A scored candidate returned from [`Bm25Index::search`].
#[derive(Debug, Clone)]
pub struct Bm25Hit {
    pub chunk_id: String,
    pub score: f32,
}

/// An owner-scoped, in-memory, reader-writer-locked BM25 index.
///
/// Readers (queries) proceed concurrently; incremental updates from the
/// Ingestion Coordinator and full rebuilds both take the writer lock —
/// rebuild is exclusive, matching §5's mutation-discipline table.
pub struct Bm25Index {
    params: Bm25Params,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    /// term -> postings
    postings: HashMap<String, Vec<Posting>>,
    /// chunk_id -> token length, used for the length-normalization term.
    doc_lengths: HashMap<String, u32>,
}

impl Bm25Index {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().doc_lengths.is_empty()
    }

    /// Incrementally adds one chunk's tokens to the index. Idempotent with
    /// respect to a prior `remove_chunk` for the same id.
    pub fn add_chunk(&self, chunk_id: &str, text: &str) {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return;
        }
        let mut freqs: HashMap<String, u32> = HashMap::new();
        for tok in &tokens {
            *freqs.entry(tok.clone()).or_insert(0) += 1;
        }

        let mut inner = self.inner.write();
        inner.doc_lengths.insert(chunk_id.to_string(), tokens.len() as u32);
        for (term, tf) in freqs {
            inner.postings.entry(term).or_default().push(Posting {
                chunk_id: chunk_id.to_string(),
                term_frequency: tf,
            });
        }
    }

    /// Removes all postings for a chunk (used when a document is deleted or
    /// re-ingested under a new chunking policy).
    pub fn remove_chunk(&self, chunk_id: &str) {
        let mut inner = self.inner.write();
        inner.doc_lengths.remove(chunk_id);
        for postings in inner.postings.values_mut() {
            postings.retain(|p| p.chunk_id != chunk_id);
        }
        inner.postings.retain(|_, v| !v.is_empty());
    }

    /// Rebuilds the index from scratch given every `(chunk_id, text)` pair
    /// for an owner. Exclusive (writer lock held for the whole rebuild);
    /// idempotent — rebuilding twice from the same input yields the same
    /// index.
    pub fn rebuild<'a>(&self, chunks: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let mut fresh = Inner::default();
        for (chunk_id, text) in chunks {
            let tokens = tokenize(text);
            if tokens.is_empty() {
                continue;
            }
            let mut freqs: HashMap<String, u32> = HashMap::new();
            for tok in &tokens {
                *freqs.entry(tok.clone()).or_insert(0) += 1;
            }
            fresh.doc_lengths.insert(chunk_id.to_string(), tokens.len() as u32);
            for (term, tf) in freqs {
                fresh.postings.entry(term).or_default().push(Posting {
                    chunk_id: chunk_id.to_string(),
                    term_frequency: tf,
                });
            }
        }
        *self.inner.write() = fresh;
    }

    /// Serializes the index to a flat representation suitable for
    /// persisting in the `bm25_postings` / `bm25_doc_stats` tables.
    pub fn to_serializable(&self) -> SerializedIndex {
        let inner = self.inner.read();
        SerializedIndex {
            postings: inner.postings.clone(),
            doc_lengths: inner.doc_lengths.clone(),
        }
    }

    pub fn from_serializable(params: Bm25Params, data: SerializedIndex) -> Self {
        Self {
            params,
            inner: RwLock::new(Inner {
                postings: data.postings,
                doc_lengths: data.doc_lengths,
            }),
        }
    }

    /// Scores `query` against the index and returns the top `k` chunks by
    /// BM25 score, descending.
    pub fn search(&self, query: &str, k: usize) -> Vec<Bm25Hit> {
        let inner = self.inner.read();
        if inner.doc_lengths.is_empty() {
            return Vec::new();
        }

        let doc_count = inner.doc_lengths.len() as f32;
        let total_length: u64 = inner.doc_lengths.values().map(|&l| l as u64).sum();
        let average_doc_length = total_length as f32 / doc_count;

        let query_terms = tokenize(query);
        let mut scores: HashMap<&str, f32> = HashMap::new();

        for term in &query_terms {
            let Some(postings) = inner.postings.get(term) else {
                continue;
            };
            let term_doc_count = postings.len() as f32;
            for posting in postings {
                let doc_length = inner
                    .doc_lengths
                    .get(&posting.chunk_id)
                    .copied()
                    .unwrap_or(0) as f32;
                let score = self.score_term(
                    posting.term_frequency as f32,
                    term_doc_count,
                    doc_length,
                    doc_count,
                    average_doc_length,
                );
                *scores.entry(posting.chunk_id.as_str()).or_insert(0.0) += score;
            }
        }

        let mut hits: Vec<Bm25Hit> = scores
            .into_iter()
            .map(|(chunk_id, score)| Bm25Hit {
                chunk_id: chunk_id.to_string(),
                score,
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        hits
    }

    // https://en.wikipedia.org/wiki/Okapi_BM25
    fn score_term(
        &self,
        term_freq: f32,
        term_doc_count: f32,
        doc_length: f32,
        doc_count: f32,
        average_doc_length: f32,
    ) -> f32 {
        let denominator = term_doc_count + 0.5;
        let numerator = doc_count - term_doc_count + 0.5;
        let idf = (numerator / denominator).ln();
        if idf.is_nan() || average_doc_length == 0.0 {
            return 0.0;
        }
        let tf_prim = 1.0 + term_freq.ln();
        let numerator = idf * (self.params.k1 + 1.0) * tf_prim;
        let denominator =
            1.0 - self.params.b + self.params.b * (doc_length / average_doc_length);
        numerator / (self.params.k1 * denominator + 1.0)
    }
}

/// Flat, serializable snapshot of a [`Bm25Index`] for persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerializedIndex {
    pub postings: HashMap<String, Vec<Posting>>,
    pub doc_lengths: HashMap<String, u32>,
}

/// Lowercase, Unicode-aware word tokenization with no stemming, per §4.5.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_index_returns_no_hits() {
        let idx = Bm25Index::new(Bm25Params::default());
        assert!(idx.search("anything", 10).is_empty());
    }

    #[test]
    fn term_match_ranks_above_non_match() {
        let idx = Bm25Index::new(Bm25Params::default());
        idx.add_chunk("c1", "the Forcite module documentation for molecular simulation");
        idx.add_chunk("c2", "unrelated content about gardening and soil");
        let hits = idx.search("Forcite", 10);
        assert_eq!(hits[0].chunk_id, "c1");
    }

    #[test]
    fn rebuild_is_idempotent() {
        let idx = Bm25Index::new(Bm25Params::default());
        let docs = vec![("c1", "alpha beta"), ("c2", "beta gamma")];
        idx.rebuild(docs.clone());
        let first = idx.search("beta", 10);
        idx.rebuild(docs);
        let second = idx.search("beta", 10);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.chunk_id, b.chunk_id);
            assert!((a.score - b.score).abs() < 1e-6);
        }
    }

    #[test]
    fn serialize_roundtrip_preserves_ranking() {
        let idx = Bm25Index::new(Bm25Params::default());
        idx.add_chunk("c1", "forcite molecular dynamics");
        idx.add_chunk("c2", "forcite forcite forcite unrelated text");
        let before = idx.search("forcite", 10);

        let snapshot = idx.to_serializable();
        let reloaded = Bm25Index::from_serializable(Bm25Params::default(), snapshot);
        let after = reloaded.search("forcite", 10);

        assert_eq!(
            before.iter().map(|h| h.chunk_id.clone()).collect::<Vec<_>>(),
            after.iter().map(|h| h.chunk_id.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn remove_chunk_drops_its_postings() {
        let idx = Bm25Index::new(Bm25Params::default());
        idx.add_chunk("c1", "forcite simulation");
        idx.remove_chunk("c1");
        assert!(idx.search("forcite", 10).is_empty());
    }
}
