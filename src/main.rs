//! `ragctl` — a CLI front-end for [`ragcore`].
//!
//! Thin wiring only: argument parsing, config loading, and component
//! construction. All behavior lives in the library crate.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use ragcore::chat::{ChatOrchestrator, ChatRequest, PromptTemplate};
use ragcore::config::{self, Config};
use ragcore::db;
use ragcore::embedder::Embedder;
use ragcore::extract::PlainTextExtractor;
use ragcore::ingest::IngestionCoordinator;
use ragcore::llm::ProviderFactory;
use ragcore::migrate;
use ragcore::models::ContentKind;
use ragcore::rerank::{FastembedCrossEncoder, Reranker};
use ragcore::session::SessionBus;
use ragcore::store::{SqlStore, Store};

#[derive(Parser)]
#[command(
    name = "ragctl",
    about = "ragcore — a local-first retrieval-and-generation core",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/ragcore.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Ingest a file into the index
    Ingest {
        /// Path to the file to ingest
        path: PathBuf,

        /// Owning tenant id
        #[arg(long)]
        owner: String,

        /// Document title (defaults to the file name)
        #[arg(long)]
        title: Option<String>,

        /// Content kind: text or markdown (others require a custom extractor)
        #[arg(long, default_value = "text")]
        kind: String,
    },

    /// Fetch a document's metadata by id
    Doc {
        /// Document id (UUID)
        id: String,
    },

    /// Remove a document and its chunks
    Rm {
        /// Document id (UUID)
        id: String,
    },

    /// Run one chat turn and print the streamed answer
    Chat {
        /// Owning tenant id
        #[arg(long)]
        owner: String,

        /// Session id (created ad hoc if omitted)
        #[arg(long)]
        session: Option<String>,

        /// Existing conversation id to continue
        #[arg(long)]
        conversation: Option<String>,

        /// The user's message
        message: String,

        /// Model id to request from the LLM provider
        #[arg(long)]
        model: Option<String>,

        /// Disable retrieval-augmented context for this turn
        #[arg(long)]
        no_rag: bool,
    },
}

async fn build_store(cfg: &Config) -> anyhow::Result<Arc<dyn Store>> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    Ok(Arc::new(SqlStore::new(pool)))
}

#[cfg(feature = "local-embeddings-fastembed")]
fn build_reranker(cfg: &Config) -> Option<Arc<Reranker>> {
    if !cfg.reranker.enabled {
        return None;
    }
    let model = cfg.reranker.model.clone();
    let reranker = Reranker::new(
        cfg.reranker.clone(),
        Box::new(move || {
            FastembedCrossEncoder::new(&model)
                .map(|e| Arc::new(e) as Arc<dyn ragcore::rerank::CrossEncoder>)
        }),
    );
    Some(Arc::new(reranker))
}

#[cfg(not(feature = "local-embeddings-fastembed"))]
fn build_reranker(cfg: &Config) -> Option<Arc<Reranker>> {
    if cfg.reranker.enabled {
        tracing::warn!("reranker.enabled is set but no local reranking backend is compiled in; skipping");
    }
    None
}

fn infer_kind(arg: &str) -> anyhow::Result<ContentKind> {
    ContentKind::parse(arg).ok_or_else(|| anyhow::anyhow!("unknown content kind: {arg} (expected text or markdown)"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let cfg = config::load_config(&cli.config)?;
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }

        Commands::Ingest { path, owner, title, kind } => {
            let cfg = config::load_config(&cli.config)?;
            let store = build_store(&cfg).await?;
            let embedder = Embedder::new(cfg.embedding.clone());
            let bus = SessionBus::new(Duration::from_secs(cfg.session.ttl_s));
            let coordinator = IngestionCoordinator::new(
                store,
                embedder,
                Arc::new(PlainTextExtractor::new()),
                (&cfg.chunking).into(),
                bus,
                cfg.ingest.concurrency,
            );

            let bytes = std::fs::read(&path)?;
            let content_kind = infer_kind(&kind)?;
            let inferred_title = title.or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()));

            let document_id = coordinator
                .ingest_document(
                    &owner,
                    inferred_title.as_deref(),
                    &path.display().to_string(),
                    content_kind,
                    &bytes,
                    CancellationToken::new(),
                )
                .await?;
            println!("Ingested document {document_id}");
        }

        Commands::Doc { id } => {
            let cfg = config::load_config(&cli.config)?;
            let store = build_store(&cfg).await?;
            match store.get_document(&id).await? {
                Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
                None => println!("no such document: {id}"),
            }
        }

        Commands::Rm { id } => {
            let cfg = config::load_config(&cli.config)?;
            let store = build_store(&cfg).await?;
            store.delete_document(&id).await?;
            println!("Removed document {id}");
        }

        Commands::Chat { owner, session, conversation, message, model, no_rag } => {
            let cfg = config::load_config(&cli.config)?;
            let store = build_store(&cfg).await?;
            let embedder = Embedder::new(cfg.embedding.clone());
            let reranker = build_reranker(&cfg);
            let llm = ProviderFactory::get_service(&cfg.llm).await?;
            let bus = SessionBus::new(Duration::from_secs(cfg.session.ttl_s));

            let session_id = session.unwrap_or_else(|| bus.create_session(&owner));

            let orchestrator = ChatOrchestrator::new(
                store,
                embedder,
                reranker,
                llm,
                bus,
                cfg.retrieval.clone(),
                cfg.query_expansion.clone(),
                cfg.corrective_rag.clone(),
            );

            let request = ChatRequest {
                owner_id: owner,
                session_id,
                conversation_id: conversation,
                user_message: message,
                model_id: model.unwrap_or_else(|| cfg.llm.default_model.clone()),
                temperature: 0.7,
                top_k: cfg.retrieval.k_out as usize,
                use_rag: !no_rag,
                use_reranker: cfg.reranker.enabled,
                use_hybrid: true,
                use_query_expansion: cfg.query_expansion.enabled,
                use_corrective: cfg.corrective_rag.enabled,
                prompt_template: PromptTemplate::CitationFirst,
                use_expert_system_prompt: false,
                custom_system_prompt: None,
            };

            let mut stream = orchestrator.generate_answer(request, CancellationToken::new()).await?;
            while let Some(token) = stream.next().await {
                match token {
                    Ok(text) => {
                        print!("{text}");
                        std::io::stdout().flush().ok();
                    }
                    Err(e) => {
                        eprintln!("\nstream error: {e}");
                        break;
                    }
                }
            }
            println!();
        }
    }

    Ok(())
}
