//! # ragcore
//!
//! **A local-first retrieval-and-generation core for AI assistants.**
//!
//! `ragcore` ingests documents, indexes them for hybrid (dense + lexical)
//! search, and drives streaming chat turns over that index — all behind a
//! narrow library surface an embedding application wires up however it
//! likes (CLI, HTTP, an MCP server).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────────────────┐   ┌──────────┐
//! │  Ingest  │──▶│  Chunk + Embed + Index      │──▶│  SQLite  │
//! │ (C4)     │   │ (C2/C3 + FTS5/BM25/vectors) │   │  (C1)    │
//! └──────────┘   └────────────────────────────┘   └────┬─────┘
//!                                                       │
//!                     ┌─────────────────────────────────┤
//!                     ▼                                 ▼
//!            ┌──────────────────┐              ┌─────────────────┐
//!            │ Hybrid Retriever │◀─────────────▶│ Chat Orchestrator│
//!            │ + Reranker (C5/C6)│  Corrective  │ (C9) + LLM (C10) │
//!            └──────────────────┘  Gate (C8)    └─────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **Ingestion Coordinator** ([`ingest`]) takes raw bytes, extracts
//!    text via a [`extract::ContentExtractor`], splits it into
//!    [`models::Chunk`]s with the boundary-cascade [`chunk`] policy, embeds
//!    them with the scoped [`embedder::Embedder`], and persists everything
//!    through the [`store::Store`] trait.
//! 2. The **Hybrid Retriever** ([`retrieval`]) fuses dense-vector and
//!    [`bm25`] lexical candidate lists via Reciprocal Rank Fusion, optionally
//!    preceded by [`expand`]'s query-expansion and followed by [`rerank`]'s
//!    cross-encoder pass.
//! 3. The **Corrective Gate** ([`corrective`]) scores the fused candidates'
//!    relevance and triggers one bounded re-trial with widened candidate
//!    caps when too few pass the relevance bar.
//! 4. The **Chat Orchestrator** ([`chat`]) ties retrieval, prompt assembly,
//!    and a streaming [`llm::LlmProvider`] together into one cancellable
//!    turn, publishing tokens and lifecycle events on the [`session::SessionBus`].
//!
//! ## Modules
//!
//! | Module | Component | Purpose |
//! |--------|-----------|---------|
//! | [`store`] | C1 | SQLite-backed persistence, owner-scoped and state-gated |
//! | [`chunk`] | C2 | Boundary-cascade text chunker |
//! | [`embedder`] | C3 | Scoped embedding-model lifecycle, adaptive batching |
//! | [`ingest`] | C4 | Per-document ingestion state machine |
//! | [`retrieval`] | C5 | Hybrid dense + lexical retrieval via RRF |
//! | [`rerank`] | C6 | Cross-encoder reranking |
//! | [`expand`] | C7 | LLM-driven query expansion |
//! | [`corrective`] | C8 | Relevance gating and re-trial |
//! | [`chat`] | C9 | Streaming chat turn orchestration |
//! | [`llm`] | C10 | LLM provider abstraction (Ollama, OpenAI-compatible) |
//! | [`session`] | C11 | In-process session table and topic pub/sub |
//! | [`bm25`] | | Tunable Okapi BM25 lexical index |
//! | [`extract`] | | Content-extraction trait boundary |
//! | [`models`] | | Core data types |
//! | [`error`] | | Crate-wide error taxonomy |
//! | [`config`] | | TOML configuration parsing and validation |
//! | [`db`] | | SQLite connection management |
//! | [`migrate`] | | Database schema migrations |
//! | [`embedding`] | | Low-level embedding provider backends |
//!
//! ## Configuration
//!
//! `ragcore` is configured via a TOML file (default: `config/ragcore.toml`).
//! See [`config`] for all available sections and [`config::load_config`] for
//! validation rules.

pub mod bm25;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod corrective;
pub mod db;
pub mod embedder;
pub mod embedding;
pub mod error;
pub mod expand;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod rerank;
pub mod retrieval;
pub mod session;
pub mod store;
