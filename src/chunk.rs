//! Boundary-aware text chunker.
//!
//! Converts [`StructuredContent`] into a sequence of [`ChunkDraft`]s
//! respecting a [`ChunkPolicy`]: a target word count with a boundary
//! cascade (paragraph, then sentence, then hard word split), word-based
//! overlap between consecutive chunks, a table-preservation escape hatch,
//! and section-path inheritance carried straight through from the
//! extractor's blocks.

use crate::config::ChunkingConfig;
use crate::extract::{Block, BlockKind, StructuredContent};

/// Chunking policy. All parameters are explicit — no globals — so the same
/// extraction can be rechunked under a different policy without touching
/// global state.
#[derive(Debug, Clone)]
pub struct ChunkPolicy {
    pub target_words: usize,
    pub overlap_words: usize,
    pub min_words: usize,
    pub max_chars: usize,
    pub preserve_tables: bool,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            target_words: 1000,
            overlap_words: 200,
            min_words: 50,
            max_chars: 8000,
            preserve_tables: true,
        }
    }
}

impl From<&ChunkingConfig> for ChunkPolicy {
    fn from(cfg: &ChunkingConfig) -> Self {
        Self {
            target_words: cfg.target_words,
            overlap_words: cfg.overlap_words,
            min_words: cfg.min_words,
            max_chars: cfg.max_chars,
            preserve_tables: cfg.preserve_tables,
        }
    }
}

/// Unembedded chunk output of the chunker; the Ingestion Coordinator's
/// Embedding stage turns this into a persisted [`crate::models::Chunk`].
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub text: String,
    pub section_path: Vec<String>,
    pub kind: String,
}

/// A sentence- or fragment-sized unit carrying its originating block's
/// section path, used internally while accumulating a chunk buffer.
struct Unit<'a> {
    text: &'a str,
    section_path: &'a [String],
    kind: BlockKind,
    /// true if this unit is the first one of a new block (a paragraph
    /// boundary candidate for the "earliest acceptable boundary" rule).
    starts_block: bool,
}

/// Chunk `content` according to `policy`.
pub fn chunk(content: &StructuredContent, policy: &ChunkPolicy) -> Vec<ChunkDraft> {
    let mut drafts = Vec::new();
    let mut prose_units: Vec<Unit> = Vec::new();

    for block in &content.blocks {
        if policy.preserve_tables && block.kind == BlockKind::Table {
            flush_prose(&mut prose_units, policy, &mut drafts);
            drafts.push(make_table_draft(block, policy.max_chars));
            continue;
        }
        let mut first = true;
        for sentence in split_sentences(&block.text) {
            prose_units.push(Unit {
                text: sentence,
                section_path: &block.section_path,
                kind: block.kind,
                starts_block: first,
            });
            first = false;
        }
    }
    flush_prose(&mut prose_units, policy, &mut drafts);

    if drafts.is_empty() {
        drafts.push(ChunkDraft {
            text: String::new(),
            section_path: Vec::new(),
            kind: "text".to_string(),
        });
    }

    merge_undersized(drafts, policy.min_words)
}

fn make_table_draft(block: &Block, max_chars: usize) -> ChunkDraft {
    let text = if block.text.len() > max_chars {
        block.text.chars().take(max_chars).collect()
    } else {
        block.text.clone()
    };
    ChunkDraft {
        text,
        section_path: block.section_path.clone(),
        kind: "table".to_string(),
    }
}

/// Greedily accumulates `units` into chunks honoring `target_words` (with a
/// 2x ceiling before forcing a split), `max_chars`, and `overlap_words`.
fn flush_prose(units: &mut Vec<Unit>, policy: &ChunkPolicy, out: &mut Vec<ChunkDraft>) {
    if units.is_empty() {
        return;
    }

    let mut buf: Vec<String> = Vec::new();
    let mut buf_section: Vec<String> = Vec::new();
    let mut buf_kind = BlockKind::Paragraph;

    let buf_words = |buf: &[String]| -> usize { buf.iter().map(|s| word_count(s)).sum() };
    let buf_chars = |buf: &[String]| -> usize { buf.iter().map(|s| s.len() + 1).sum() };

    let mut i = 0;
    while i < units.len() {
        let unit = &units[i];

        // Paragraph-boundary flush: we've already met target and a new
        // block is starting — this is the earliest acceptable boundary.
        if unit.starts_block && buf_words(&buf) >= policy.target_words && !buf.is_empty() {
            out.push(finish_chunk(&buf, &buf_section, buf_kind));
            carry_overlap(&mut buf, policy.overlap_words);
        }

        if buf.is_empty() {
            buf_section = unit.section_path.to_vec();
            buf_kind = unit.kind;
        }

        // A single unit larger than max_chars is hard-split by words.
        if unit.text.len() > policy.max_chars {
            if !buf.is_empty() {
                out.push(finish_chunk(&buf, &buf_section, buf_kind));
                buf.clear();
            }
            for piece in hard_split(unit.text, policy.max_chars) {
                out.push(ChunkDraft {
                    text: piece.to_string(),
                    section_path: unit.section_path.to_vec(),
                    kind: block_kind_label(unit.kind).to_string(),
                });
            }
            i += 1;
            continue;
        }

        buf.push(unit.text.to_string());

        let at_ceiling = buf_words(&buf) >= policy.target_words * 2;
        let over_max_chars = buf_chars(&buf) > policy.max_chars;
        if at_ceiling || over_max_chars {
            out.push(finish_chunk(&buf, &buf_section, buf_kind));
            carry_overlap(&mut buf, policy.overlap_words);
        }

        i += 1;
    }

    if !buf.is_empty() {
        out.push(finish_chunk(&buf, &buf_section, buf_kind));
    }

    units.clear();
}

fn finish_chunk(buf: &[String], section_path: &[String], kind: BlockKind) -> ChunkDraft {
    ChunkDraft {
        text: buf.join(" "),
        section_path: section_path.to_vec(),
        kind: block_kind_label(kind).to_string(),
    }
}

fn block_kind_label(kind: BlockKind) -> &'static str {
    match kind {
        BlockKind::Paragraph => "text",
        BlockKind::Heading => "text",
        BlockKind::Table => "table",
        BlockKind::ImageOcr => "image-ocr",
        BlockKind::ImageCaption => "image-caption",
        BlockKind::Code => "code",
    }
}

/// Retains the tail `overlap_words` words of the just-flushed buffer as the
/// seed of the next chunk's buffer, when both are long enough to share one.
fn carry_overlap(buf: &mut Vec<String>, overlap_words: usize) {
    if overlap_words == 0 || buf.is_empty() {
        buf.clear();
        return;
    }

    let joined = buf.join(" ");
    let words: Vec<&str> = joined.split_whitespace().collect();
    buf.clear();
    if words.len() <= overlap_words {
        // Entire flushed buffer becomes the overlap seed; nothing dropped.
        buf.push(joined);
        return;
    }
    let tail = words[words.len() - overlap_words..].join(" ");
    buf.push(tail);
}

fn hard_split(text: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            pieces.push(remaining);
            break;
        }
        let window = &remaining[..max_chars];
        let split_at = window
            .rfind(char::is_whitespace)
            .map(|p| p + 1)
            .unwrap_or(max_chars);
        let split_at = split_at.max(1);
        pieces.push(remaining[..split_at].trim_end());
        remaining = remaining[split_at..].trim_start();
    }
    pieces
}

fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Splits text into sentences on `.`/`!`/`?` followed by whitespace,
/// keeping terminal punctuation attached. Falls back to the whole string
/// when no sentence boundary is found.
fn split_sentences(text: &str) -> Vec<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut sentences = Vec::new();
    let bytes = trimmed.as_bytes();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'.' || c == b'!' || c == b'?' {
            let next_is_boundary = bytes
                .get(i + 1)
                .map(|b| b.is_ascii_whitespace())
                .unwrap_or(true);
            if next_is_boundary {
                let sentence = trimmed[start..=i].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = i + 1;
            }
        }
        i += 1;
    }
    let tail = trimmed[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    if sentences.is_empty() {
        sentences.push(trimmed);
    }
    sentences
}

/// Merges any chunk shorter than `min_words` into its predecessor so the
/// policy's `min_words` floor holds for every chunk but the sole chunk of a
/// short document.
fn merge_undersized(drafts: Vec<ChunkDraft>, min_words: usize) -> Vec<ChunkDraft> {
    if drafts.len() <= 1 {
        return drafts;
    }
    let mut merged: Vec<ChunkDraft> = Vec::with_capacity(drafts.len());
    for draft in drafts {
        if word_count(&draft.text) < min_words {
            if let Some(prev) = merged.last_mut() {
                if !prev.text.is_empty() && !draft.text.is_empty() {
                    prev.text.push(' ');
                }
                prev.text.push_str(&draft.text);
                continue;
            }
        }
        merged.push(draft);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Block;
    use serde_json::Value;

    fn para(text: &str) -> Block {
        Block {
            kind: BlockKind::Paragraph,
            text: text.to_string(),
            section_path: Vec::new(),
            attributes: Value::Null,
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        let content = StructuredContent::new(vec![para("Hello, world.")]);
        let policy = ChunkPolicy::default();
        let drafts = chunk(&content, &policy);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].text, "Hello, world.");
    }

    #[test]
    fn empty_content_yields_one_empty_chunk() {
        let content = StructuredContent::default();
        let drafts = chunk(&content, &ChunkPolicy::default());
        assert_eq!(drafts.len(), 1);
        assert!(drafts[0].text.is_empty());
    }

    #[test]
    fn text_under_min_words_is_single_chunk() {
        let content = StructuredContent::new(vec![para("Barcelona is the capital of Catalonia.")]);
        let policy = ChunkPolicy {
            target_words: 1000,
            overlap_words: 200,
            min_words: 50,
            max_chars: 8000,
            preserve_tables: true,
        };
        let drafts = chunk(&content, &policy);
        assert_eq!(drafts.len(), 1);
    }

    #[test]
    fn oversized_paragraph_forces_split() {
        let long_sentence = "word ".repeat(50).trim().to_string() + ".";
        let text = vec![long_sentence.clone(); 10].join(" ");
        let content = StructuredContent::new(vec![para(&text)]);
        let policy = ChunkPolicy {
            target_words: 20,
            overlap_words: 5,
            min_words: 1,
            max_chars: 8000,
            preserve_tables: true,
        };
        let drafts = chunk(&content, &policy);
        assert!(drafts.len() > 1);
    }

    #[test]
    fn table_block_preserved_as_single_chunk() {
        let table = Block {
            kind: BlockKind::Table,
            text: "| a | b |\n| 1 | 2 |".to_string(),
            section_path: vec!["Appendix".to_string()],
            attributes: Value::Null,
        };
        let content = StructuredContent::new(vec![para("intro"), table]);
        let drafts = chunk(&content, &ChunkPolicy::default());
        let table_draft = drafts.iter().find(|d| d.kind == "table").unwrap();
        assert!(table_draft.text.contains("| a | b |"));
        assert_eq!(table_draft.section_path, vec!["Appendix".to_string()]);
    }

    #[test]
    fn deterministic_across_runs() {
        let content = StructuredContent::new(vec![para("Alpha beta gamma."), para("Delta epsilon.")]);
        let policy = ChunkPolicy::default();
        let a = chunk(&content, &policy);
        let b = chunk(&content, &policy);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
        }
    }
}
