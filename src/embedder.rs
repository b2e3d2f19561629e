//! Scoped embedding-model lifecycle: `load()`/`unload()`, idle-unload, adaptive
//! batch sizing, and FIFO single-flight serialization, per §4.3.
//!
//! The teacher's `embedding` module knows how to call a provider once; it has
//! no notion of a model staying "loaded" between calls. Local backends
//! (fastembed, tract) hold accelerator memory for the lifetime of the
//! provider value, so this module wraps provider construction in an explicit
//! scoped resource that can be released early and reloaded lazily.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::config::EmbeddingConfig;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{RagError, Result};

/// Batch sizes the adaptive controller steps through, per §4.3.
const ADAPTIVE_LADDER: [usize; 4] = [4, 8, 12, 16];
/// Successful batches at a given rung before stepping up.
const STEP_UP_THRESHOLD: u32 = 100;
/// Retries on OOM (stepping down each time) before `ResourceExhausted`.
const MAX_OOM_RETRIES: u32 = 3;

/// Batch-size policy for [`Embedder::embed_batch`].
#[derive(Debug, Clone, Copy)]
pub enum BatchSize {
    Fixed(usize),
    Adaptive,
}

/// Options accepted by [`Embedder::embed_batch`].
#[derive(Debug, Clone)]
pub struct EmbedOptions {
    pub batch_size: BatchSize,
    pub show_progress: bool,
    /// Observed between sub-batches, and while a sub-batch call is in
    /// flight, so a caller can cancel a multi-sub-batch `embed_batch` call
    /// without waiting for it to run to completion.
    pub cancellation_token: CancellationToken,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            batch_size: BatchSize::Adaptive,
            show_progress: false,
            cancellation_token: CancellationToken::new(),
        }
    }
}

struct AdaptiveState {
    rung: usize,
    successes_at_rung: u32,
}

impl AdaptiveState {
    fn new() -> Self {
        Self {
            rung: ADAPTIVE_LADDER.len() - 1,
            successes_at_rung: 0,
        }
    }

    fn current(&self) -> usize {
        ADAPTIVE_LADDER[self.rung]
    }

    fn step_down(&mut self) -> usize {
        self.rung = self.rung.saturating_sub(1);
        self.successes_at_rung = 0;
        if self.rung == 0 {
            1
        } else {
            self.current()
        }
    }

    fn record_success(&mut self) {
        self.successes_at_rung += 1;
        if self.successes_at_rung >= STEP_UP_THRESHOLD && self.rung + 1 < ADAPTIVE_LADDER.len() {
            self.rung += 1;
            self.successes_at_rung = 0;
        }
    }
}

struct LoadedModel {
    provider: Box<dyn EmbeddingProvider>,
    last_used: Instant,
}

/// Scoped embedding-model resource: lazily loaded, idle-unloaded, and
/// serialized behind a FIFO queue so at most one batch is ever in flight.
///
/// Cloning an `Embedder` shares the same underlying model slot and queue —
/// all clones observe the same lifecycle.
#[derive(Clone)]
pub struct Embedder {
    config: EmbeddingConfig,
    slot: Arc<Mutex<Option<LoadedModel>>>,
    adaptive: Arc<Mutex<AdaptiveState>>,
}

impl Embedder {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            config,
            slot: Arc::new(Mutex::new(None)),
            adaptive: Arc::new(Mutex::new(AdaptiveState::new())),
        }
    }

    pub fn dims(&self) -> usize {
        self.config.dims
    }

    pub fn model_name(&self) -> Option<&str> {
        self.config.model.as_deref()
    }

    /// Whether this `Embedder` was configured with a real provider (not
    /// `"disabled"`). Callers that can proceed without vectors — e.g. the
    /// Ingestion Coordinator persisting text-only chunks — use this to skip
    /// the Embedding stage's provider call rather than surfacing an error.
    pub fn is_enabled(&self) -> bool {
        self.config.provider != "disabled"
    }

    /// Loads the underlying provider if not already loaded. Idempotent.
    pub async fn load(&self) -> Result<()> {
        self.acquire().await?;
        Ok(())
    }

    /// Releases the provider and any accelerator memory it holds. Idempotent;
    /// safe to call after cancellation or failure.
    pub async fn unload(&self) {
        let mut guard = self.slot.lock().await;
        *guard = None;
    }

    /// Releases the model if it has been idle longer than `idle_timeout`.
    /// Intended to be driven by a periodic background tick owned by the
    /// caller (e.g. the Ingestion Coordinator's housekeeping loop).
    pub async fn idle_tick(&self, idle_timeout: Duration) {
        let mut guard = self.slot.lock().await;
        if let Some(model) = guard.as_ref() {
            if model.last_used.elapsed() >= idle_timeout {
                *guard = None;
            }
        }
    }

    async fn acquire(&self) -> Result<MutexGuard<'_, Option<LoadedModel>>> {
        let mut guard = self.slot.lock().await;
        if guard.is_none() {
            let provider = embedding::create_provider(&self.config)
                .map_err(|e| RagError::model_unavailable(e.to_string()))?;
            *guard = Some(LoadedModel {
                provider,
                last_used: Instant::now(),
            });
        }
        Ok(guard)
    }

    /// Embeds a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()], EmbedOptions::default()).await?;
        out.pop()
            .ok_or_else(|| RagError::model_unavailable("embedder returned no vectors"))
    }

    /// Embeds `texts` as one or more sub-batches, serialized behind the
    /// single-flight FIFO queue (the slot lock). The ladder rung is only
    /// consulted when `options.batch_size` is [`BatchSize::Adaptive`].
    pub async fn embed_batch(&self, texts: &[String], options: EmbedOptions) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self.acquire().await?;
        let mut results = Vec::with_capacity(texts.len());
        let mut cursor = 0usize;

        while cursor < texts.len() {
            if options.cancellation_token.is_cancelled() {
                return Err(RagError::Cancelled { correlation_id: "embed_batch".to_string() });
            }

            let batch_len = match options.batch_size {
                BatchSize::Fixed(n) => n.max(1),
                BatchSize::Adaptive => self.adaptive.lock().await.current(),
            };
            let end = (cursor + batch_len).min(texts.len());
            let chunk = &texts[cursor..end];

            let (embedded, processed) = self
                .embed_with_retry(
                    &mut guard,
                    chunk,
                    matches!(options.batch_size, BatchSize::Adaptive),
                    &options.cancellation_token,
                )
                .await?;
            results.extend(embedded);
            cursor += processed;
        }

        if let Some(model) = guard.as_mut() {
            model.last_used = Instant::now();
        }

        Ok(results)
    }

    /// Embeds a single query, applying the provider's natural text encoding.
    /// Model-specific query/document prefixing, where a backend requires it,
    /// belongs to the provider implementation, not this scoped wrapper.
    pub async fn encode_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_one(text).await
    }

    /// Embeds `chunk`, retrying at a shrunk sub-slice (per the adaptive
    /// ladder's `step_down`) on repeated OOM rather than re-submitting the
    /// same oversized slice. Returns the embedded vectors together with how
    /// many leading texts of `chunk` they cover — on a mid-retry shrink this
    /// is less than `chunk.len()`, and the caller advances its cursor by
    /// only that many so the remainder is picked up by the next sub-batch
    /// at the now-lower rung.
    async fn embed_with_retry(
        &self,
        guard: &mut MutexGuard<'_, Option<LoadedModel>>,
        chunk: &[String],
        adaptive: bool,
        cancellation_token: &CancellationToken,
    ) -> Result<(Vec<Vec<f32>>, usize)> {
        let mut attempts = 0u32;
        let mut current_len = chunk.len();
        loop {
            let provider_ref: &dyn EmbeddingProvider = guard
                .as_ref()
                .map(|m| m.provider.as_ref())
                .ok_or_else(|| RagError::model_unavailable("embedding provider not loaded"))?;

            let current = &chunk[..current_len];
            let call = embedding::embed_texts(provider_ref, &self.config, current);
            let result = tokio::select! {
                _ = cancellation_token.cancelled() => {
                    return Err(RagError::Cancelled { correlation_id: "embed_batch".to_string() });
                }
                r = call => r,
            };

            match result {
                Ok(v) => {
                    if adaptive {
                        self.adaptive.lock().await.record_success();
                    }
                    return Ok((v, current_len));
                }
                Err(e) => {
                    let is_oom = is_out_of_memory(&e);
                    if !is_oom || !adaptive {
                        return Err(RagError::model_unavailable(e.to_string()));
                    }
                    attempts += 1;
                    if attempts > MAX_OOM_RETRIES {
                        return Err(RagError::resource_exhausted(format!(
                            "embedding batch failed after {MAX_OOM_RETRIES} OOM retries: {e}"
                        )));
                    }
                    let stepped = self.adaptive.lock().await.step_down();
                    let next_len = stepped.min(current_len);
                    current_len = if next_len < current_len {
                        next_len
                    } else {
                        current_len.saturating_sub(1).max(1)
                    };
                }
            }
        }
    }
}

/// Heuristic OOM detection on the provider's error text. Local backends
/// (fastembed/tract/ORT) don't expose a typed OOM error across the FFI
/// boundary; they report it as a string.
fn is_out_of_memory(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("out of memory") || msg.contains("oom") || msg.contains("allocation failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_config() -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "disabled".to_string(),
            ..EmbeddingConfig::default()
        }
    }

    #[tokio::test]
    async fn load_is_idempotent() {
        let embedder = Embedder::new(disabled_config());
        embedder.load().await.unwrap();
        embedder.load().await.unwrap();
    }

    #[tokio::test]
    async fn unload_then_reload_works() {
        let embedder = Embedder::new(disabled_config());
        embedder.load().await.unwrap();
        embedder.unload().await;
        embedder.load().await.unwrap();
    }

    #[tokio::test]
    async fn disabled_provider_surfaces_model_unavailable() {
        let embedder = Embedder::new(disabled_config());
        let err = embedder.embed_one("hello").await.unwrap_err();
        assert!(matches!(err, RagError::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn empty_batch_short_circuits() {
        let embedder = Embedder::new(disabled_config());
        let out = embedder.embed_batch(&[], EmbedOptions::default()).await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn adaptive_state_steps_down_then_floors_at_one() {
        let mut state = AdaptiveState::new();
        assert_eq!(state.current(), 16);
        assert_eq!(state.step_down(), 12);
        assert_eq!(state.step_down(), 8);
        assert_eq!(state.step_down(), 4);
        assert_eq!(state.step_down(), 1);
    }

    #[test]
    fn adaptive_state_steps_up_after_threshold() {
        let mut state = AdaptiveState::new();
        state.step_down();
        state.step_down();
        state.step_down(); // rung at index 0 -> 4
        assert_eq!(state.current(), 4);
        for _ in 0..STEP_UP_THRESHOLD {
            state.record_success();
        }
        assert_eq!(state.current(), 8);
    }
}
