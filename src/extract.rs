//! `ContentExtractor` — the external collaborator interface consumed by the
//! Ingestion Coordinator's extraction stage.
//!
//! Turning raw bytes of a given [`crate::models::ContentKind`] into
//! [`StructuredContent`] is explicitly out of scope for this crate beyond a
//! minimal text/markdown implementation: PDF, HTML, OCR, and vision
//! extraction are call sites for a caller-supplied [`ContentExtractor`].

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{RagError, Result};
use crate::models::ContentKind;

/// The structural kind of one extracted [`Block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Paragraph,
    Heading,
    Table,
    ImageOcr,
    ImageCaption,
    Code,
}

/// One structural unit of an extracted document, in document order.
#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    pub text: String,
    pub section_path: Vec<String>,
    pub attributes: Value,
}

/// Ordered extraction output consumed by the Chunker (§4.2).
#[derive(Debug, Clone, Default)]
pub struct StructuredContent {
    pub blocks: Vec<Block>,
}

impl StructuredContent {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }
}

/// External collaborator: converts raw document bytes of a declared kind
/// into [`StructuredContent`]. Implementations for PDF/HTML/image kinds are
/// expected to be supplied by the embedding application; this crate ships
/// only [`PlainTextExtractor`].
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, source: &[u8], kind: ContentKind) -> Result<StructuredContent>;
}

/// Built-in extractor for `text` and `markdown` content.
///
/// Markdown is split on ATX headings (`#`, `##`, ...) into heading blocks,
/// with section-path inheritance; everything else becomes paragraph blocks
/// split on blank lines. Plain text is treated identically but without
/// heading detection.
#[derive(Debug, Default)]
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    pub fn new() -> Self {
        Self
    }

    fn extract_markdown(text: &str) -> StructuredContent {
        let mut blocks = Vec::new();
        let mut section_path: Vec<String> = Vec::new();

        for raw_para in text.split("\n\n") {
            let para = raw_para.trim();
            if para.is_empty() {
                continue;
            }
            if let Some(first_line) = para.lines().next() {
                let trimmed = first_line.trim_start();
                if let Some(level) = heading_level(trimmed) {
                    let title = trimmed.trim_start_matches('#').trim().to_string();
                    section_path.truncate(level.saturating_sub(1));
                    section_path.push(title.clone());
                    blocks.push(Block {
                        kind: BlockKind::Heading,
                        text: title,
                        section_path: section_path.clone(),
                        attributes: Value::Null,
                    });
                    let rest = para.splitn(2, '\n').nth(1).unwrap_or("").trim();
                    if !rest.is_empty() {
                        blocks.push(Block {
                            kind: BlockKind::Paragraph,
                            text: rest.to_string(),
                            section_path: section_path.clone(),
                            attributes: Value::Null,
                        });
                    }
                    continue;
                }
            }
            blocks.push(Block {
                kind: BlockKind::Paragraph,
                text: para.to_string(),
                section_path: section_path.clone(),
                attributes: Value::Null,
            });
        }

        StructuredContent::new(blocks)
    }
}

fn heading_level(line: &str) -> Option<usize> {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    line.as_bytes().get(hashes).map_or(true, |&b| b == b' ').then_some(hashes)
}

#[async_trait]
impl ContentExtractor for PlainTextExtractor {
    async fn extract(&self, source: &[u8], kind: ContentKind) -> Result<StructuredContent> {
        let text = std::str::from_utf8(source)
            .map_err(|e| RagError::invalid(format!("document is not valid utf-8: {e}")))?;

        match kind {
            ContentKind::Text => Ok(StructuredContent::new(
                text.split("\n\n")
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| Block {
                        kind: BlockKind::Paragraph,
                        text: p.to_string(),
                        section_path: Vec::new(),
                        attributes: Value::Null,
                    })
                    .collect(),
            )),
            ContentKind::Markdown => Ok(Self::extract_markdown(text)),
            other => Err(RagError::invalid(format!(
                "no built-in extractor for content kind '{}'; supply a ContentExtractor",
                other.as_str()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extracts_plain_paragraphs() {
        let extractor = PlainTextExtractor::new();
        let content = extractor
            .extract(b"First paragraph.\n\nSecond paragraph.", ContentKind::Text)
            .await
            .unwrap();
        assert_eq!(content.blocks.len(), 2);
        assert_eq!(content.blocks[0].kind, BlockKind::Paragraph);
    }

    #[tokio::test]
    async fn markdown_headings_build_section_path() {
        let extractor = PlainTextExtractor::new();
        let md = "# Title\nIntro text.\n\n## Sub\nBody text.";
        let content = extractor.extract(md.as_bytes(), ContentKind::Markdown).await.unwrap();
        let heading = content.blocks.iter().find(|b| b.kind == BlockKind::Heading).unwrap();
        assert_eq!(heading.section_path, vec!["Title".to_string()]);
        let sub = content
            .blocks
            .iter()
            .find(|b| b.text == "Sub")
            .unwrap();
        assert_eq!(sub.section_path, vec!["Title".to_string(), "Sub".to_string()]);
    }

    #[tokio::test]
    async fn rejects_unknown_kind() {
        let extractor = PlainTextExtractor::new();
        let err = extractor.extract(b"data", ContentKind::Pdf).await.unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }
}
