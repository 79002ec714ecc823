use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;

use super::Embedder;
use crate::error::EmbeddingError;

/// Read-through LRU cache of single-input embeddings, keyed by the exact input text.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl CachedEmbedder {
    /// Wraps `inner` with a cache of `capacity` entries; a zero capacity returns `inner` as is.
    pub fn wrap(inner: Arc<dyn Embedder>, capacity: usize) -> Arc<dyn Embedder> {
        match NonZeroUsize::new(capacity) {
            Some(capacity) => Arc::new(Self {
                inner,
                cache: Mutex::new(LruCache::new(capacity)),
            }),
            None => inner,
        }
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.inner.embed_batch(inputs).await
    }

    async fn embed(&self, input: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(hit) = {
            let mut guard = self.cache.lock().await;
            guard.get(input).cloned()
        } {
            return Ok(hit);
        }
        let embedding = self.inner.embed(input).await?;
        self.cache
            .lock()
            .await
            .put(input.to_string(), embedding.clone());
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEmbedder(AtomicUsize);

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(inputs.iter().map(|_| vec![0.5, 0.5]).collect())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn repeated_queries_hit_the_cache() {
        let counter = Arc::new(CountingEmbedder::default());
        let cached = CachedEmbedder::wrap(counter.clone(), 2);
        cached.embed("toyota").await.unwrap();
        cached.embed("toyota").await.unwrap();
        cached.embed("ford").await.unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_capacity_disables_caching() {
        let counter = Arc::new(CountingEmbedder::default());
        let cached = CachedEmbedder::wrap(counter.clone(), 0);
        cached.embed("toyota").await.unwrap();
        cached.embed("toyota").await.unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
