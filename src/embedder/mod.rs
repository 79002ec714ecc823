//! Embedding providers used by the indexer and the search engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use tracing::warn;

use crate::error::EmbeddingError;

mod cached;
pub mod openai;

pub use cached::CachedEmbedder;
pub use openai::OpenAiEmbedder;

/// Turns text into fixed-dimension vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds a batch of inputs, returning one vector per input in the same order.
    async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embeds a single input.
    async fn embed(&self, input: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[input])
            .await?
            .pop()
            .ok_or_else(|| EmbeddingError::Malformed("empty embedding batch".to_string()))
    }
}

/// OpenAI-compatible embedding settings shared by both binaries.
#[derive(Args, Debug, Clone)]
pub struct EmbeddingArgs {
    /// OpenAI API key used for embeddings; without one, search uses filters only
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Embedding model identifier
    #[arg(long, env = "CARCRAWL_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    pub embedding_model: String,

    /// Embedding dimension; also sizes the vector column
    #[arg(long, env = "CARCRAWL_EMBEDDING_DIMS", default_value_t = 1536)]
    pub embedding_dims: usize,

    /// Base URL for OpenAI-compatible endpoints
    #[arg(long, env = "CARCRAWL_OPENAI_BASE", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Max inputs per embedding request
    #[arg(long, env = "CARCRAWL_OPENAI_BATCH", default_value_t = 32)]
    pub embedding_batch: usize,

    /// Seconds before an embedding request times out
    #[arg(long, env = "CARCRAWL_OPENAI_TIMEOUT_SECS", default_value_t = 30)]
    pub embedding_timeout_secs: u64,

    /// Retry attempts for transient embedding errors
    #[arg(long, env = "CARCRAWL_OPENAI_MAX_RETRIES", default_value_t = 3)]
    pub embedding_max_retries: usize,
}

impl EmbeddingArgs {
    /// Per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs.max(1))
    }

    /// API key, ignoring blank values.
    pub fn api_key(&self) -> Option<&str> {
        self.openai_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    /// Builds the configured client. Without an API key every call fails with
    /// [`EmbeddingError::Unavailable`], which search turns into its filters-only path.
    pub fn build_embedder(&self) -> Result<Arc<dyn Embedder>> {
        let Some(api_key) = self.api_key() else {
            warn!("no OpenAI API key configured; embeddings are unavailable");
            return Ok(Arc::new(UnavailableEmbedder::new("no API key")));
        };
        let embedder = OpenAiEmbedder::new(
            api_key.to_string(),
            self.openai_base_url.clone(),
            self.embedding_model.clone(),
            Some(self.embedding_dims),
            self.timeout(),
            self.embedding_max_retries,
            self.embedding_batch.max(1),
        )?;
        Ok(Arc::new(embedder))
    }
}

/// Stand-in used when no embedding provider is configured.
#[derive(Debug, Clone)]
pub struct UnavailableEmbedder {
    reason: String,
}

impl UnavailableEmbedder {
    /// Embedder that always fails with `reason`.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Embedder for UnavailableEmbedder {
    async fn embed_batch(&self, _inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Unavailable(self.reason.clone()))
    }
}
