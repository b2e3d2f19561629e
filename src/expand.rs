//! Query Expander (C7) — LLM-driven multi-query generation with graceful
//! fallback to the original query, per §4.7.
//!
//! Grounded in the teacher's soft-timeout pattern for best-effort enrichment
//! steps (`tokio::time::timeout` wrapping a single provider call): any
//! failure mode here — timeout, provider error, malformed response — degrades
//! to "no expansion" rather than aborting the pipeline.

use std::time::Duration;

use crate::config::QueryExpansionConfig;
use crate::llm::{GenerateOptions, LlmProvider};

const EXPANSION_PROMPT_PREAMBLE: &str = "Rephrase the following search query in";

/// Expands `query` into up to `config.n_variants` additional phrasings,
/// returning `[query, variant_1, .., variant_m]` with `m <= n_variants`.
/// The original query is always first. On any failure (timeout, provider
/// error, malformed response) returns `[query]` alone.
pub async fn expand(provider: &dyn LlmProvider, query: &str, config: &QueryExpansionConfig) -> Vec<String> {
    if !config.enabled || config.n_variants == 0 {
        return vec![query.to_string()];
    }

    let prompt = build_prompt(query, config.n_variants);
    let options = GenerateOptions {
        model_id: "default".to_string(),
        temperature: config.temperature,
        max_tokens: Some(256),
        stop_sequences: Vec::new(),
        top_p: None,
    };

    let outcome = tokio::time::timeout(
        Duration::from_secs(config.timeout_secs),
        provider.generate(&prompt, &options),
    )
    .await;

    match outcome {
        Ok(Ok(text)) => {
            let variants = parse_variants(&text, query, config.n_variants);
            let mut result = vec![query.to_string()];
            result.extend(variants);
            result
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "query expansion provider call failed, using original query only");
            vec![query.to_string()]
        }
        Err(_) => {
            tracing::warn!(timeout_secs = config.timeout_secs, "query expansion timed out, using original query only");
            vec![query.to_string()]
        }
    }
}

fn build_prompt(query: &str, n_variants: usize) -> String {
    format!(
        "{EXPANSION_PROMPT_PREAMBLE} {n_variants} distinct alternative ways, one per line, with no \
         numbering, bullets, or commentary. Query: \"{query}\""
    )
}

/// Parses a newline-delimited list of variants, dropping blanks, the
/// original query (case-insensitively), and duplicates, then truncates to
/// `n_variants`. Malformed or empty responses yield an empty `Vec`, which
/// degrades expansion to "no variants" while still keeping the original
/// query as the sole entry (handled by the caller).
fn parse_variants(response: &str, original: &str, n_variants: usize) -> Vec<String> {
    let original_lower = original.trim().to_lowercase();
    let mut seen = vec![original_lower.clone()];
    let mut variants = Vec::new();

    for line in response.lines() {
        let candidate = strip_list_markers(line.trim());
        if candidate.is_empty() {
            continue;
        }
        let lower = candidate.to_lowercase();
        if seen.contains(&lower) {
            continue;
        }
        seen.push(lower);
        variants.push(candidate.to_string());
        if variants.len() >= n_variants {
            break;
        }
    }

    variants
}

/// Strips common list-item prefixes (`1.`, `-`, `*`, `•`) a model may emit
/// despite being asked not to.
fn strip_list_markers(line: &str) -> &str {
    let trimmed = line.trim_start_matches(['-', '*', '•']).trim_start();
    match trimmed.find(". ") {
        Some(idx) if trimmed[..idx].chars().all(|c| c.is_ascii_digit()) && idx > 0 => {
            trimmed[idx + 2..].trim()
        }
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as RagResult;
    use crate::llm::{HealthStatus, TokenStream};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct FixedProvider(String);

    #[async_trait]
    impl LlmProvider for FixedProvider {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> RagResult<String> {
            Ok(self.0.clone())
        }
        async fn generate_stream(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
            _cancellation_token: CancellationToken,
        ) -> RagResult<TokenStream> {
            unimplemented!("not exercised by expander tests")
        }
        async fn list_models(&self) -> RagResult<Vec<String>> {
            Ok(vec![])
        }
        async fn health_check(&self) -> HealthStatus {
            HealthStatus::Healthy
        }
        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl LlmProvider for FailingProvider {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> RagResult<String> {
            Err(crate::error::RagError::provider("test", "boom"))
        }
        async fn generate_stream(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
            _cancellation_token: CancellationToken,
        ) -> RagResult<TokenStream> {
            unimplemented!("not exercised by expander tests")
        }
        async fn list_models(&self) -> RagResult<Vec<String>> {
            Ok(vec![])
        }
        async fn health_check(&self) -> HealthStatus {
            HealthStatus::Down
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn enabled_config() -> QueryExpansionConfig {
        QueryExpansionConfig { enabled: true, n_variants: 3, timeout_secs: 5, temperature: 0.3 }
    }

    #[tokio::test]
    async fn disabled_returns_original_only() {
        let provider = FixedProvider("anything".to_string());
        let config = QueryExpansionConfig { enabled: false, ..enabled_config() };
        let out = expand(&provider, "cats", &config).await;
        assert_eq!(out, vec!["cats".to_string()]);
    }

    #[tokio::test]
    async fn parses_newline_delimited_variants() {
        let provider = FixedProvider("feline pets\nhousehold cats\ndomestic cat care".to_string());
        let out = expand(&provider, "cats", &enabled_config()).await;
        assert_eq!(out[0], "cats");
        assert_eq!(out.len(), 4);
        assert!(out[1..].iter().all(|v| v.to_lowercase() != "cats"));
    }

    #[tokio::test]
    async fn drops_duplicate_of_original() {
        let provider = FixedProvider("Cats\nfeline pets".to_string());
        let out = expand(&provider, "cats", &enabled_config()).await;
        assert_eq!(out, vec!["cats".to_string(), "feline pets".to_string()]);
    }

    #[tokio::test]
    async fn strips_numbered_list_markers() {
        let provider = FixedProvider("1. feline companions\n2. house cats".to_string());
        let out = expand(&provider, "cats", &enabled_config()).await;
        assert_eq!(out[1], "feline companions");
        assert_eq!(out[2], "house cats");
    }

    #[tokio::test]
    async fn truncates_to_n_variants() {
        let provider = FixedProvider("a\nb\nc\nd\ne".to_string());
        let config = QueryExpansionConfig { n_variants: 2, ..enabled_config() };
        let out = expand(&provider, "q", &config).await;
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_original() {
        let provider = FailingProvider;
        let out = expand(&provider, "cats", &enabled_config()).await;
        assert_eq!(out, vec!["cats".to_string()]);
    }

    #[tokio::test]
    async fn blank_response_yields_original_only() {
        let provider = FixedProvider("   \n\n".to_string());
        let out = expand(&provider, "cats", &enabled_config()).await;
        assert_eq!(out, vec!["cats".to_string()]);
    }
}
