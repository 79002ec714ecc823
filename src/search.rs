//! Hybrid search: inferred plus explicit filters, ranked by vector similarity when the query
//! can be embedded and by recency otherwise.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::embedder::Embedder;
use crate::error::{EmbeddingError, StoreError};
use crate::filters::SearchFilters;
use crate::query::FilterExtractor;
use crate::store::VehicleStore;
use crate::vehicle::RankedVehicle;

/// Result count used when the request does not specify one.
pub const DEFAULT_LIMIT: usize = 20;
/// Largest result count a request may ask for.
pub const MAX_LIMIT: usize = 100;

/// A search request as accepted over HTTP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Free-text query.
    pub query: String,
    /// Requested result count.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Caller-supplied filters; these win over inferred ones.
    #[serde(default)]
    pub filters: Option<SearchFilters>,
}

impl SearchRequest {
    /// Request for `query` with defaults everywhere else.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Sets the requested result count.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets explicit filters.
    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = Some(filters);
        self
    }
}

/// Which ranking produced the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchType {
    /// Ranked by cosine similarity to the query embedding.
    Semantic,
    /// Embedding unavailable; filtered and ordered by recency.
    FiltersOnly,
}

/// Search results plus the filters that were applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Query as received (trimmed).
    pub query: String,
    /// Number of vehicles returned.
    pub total_results: usize,
    /// Matching vehicles, best first.
    pub vehicles: Vec<RankedVehicle>,
    /// Ranking used.
    pub search_type: SearchType,
    /// Effective filters after merging explicit over inferred.
    pub extracted_filters: SearchFilters,
}

/// Combines query understanding, embedding and the store into one search call.
#[derive(Clone)]
pub struct HybridSearchEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VehicleStore>,
    extractor: Option<FilterExtractor>,
    embed_timeout: Duration,
    default_limit: usize,
    max_limit: usize,
}

impl HybridSearchEngine {
    /// Engine over `store`. Without an extractor only explicit filters apply.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VehicleStore>,
        extractor: Option<FilterExtractor>,
    ) -> Self {
        Self {
            embedder,
            store,
            extractor,
            embed_timeout: Duration::from_secs(30),
            default_limit: DEFAULT_LIMIT,
            max_limit: MAX_LIMIT,
        }
    }

    /// Bounds each query embedding call.
    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    /// Overrides the default and maximum result counts.
    pub fn with_limits(mut self, default_limit: usize, max_limit: usize) -> Self {
        self.max_limit = max_limit.max(1);
        self.default_limit = default_limit.clamp(1, self.max_limit);
        self
    }

    fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit)
    }

    async fn effective_filters(
        &self,
        query: &str,
        explicit: Option<SearchFilters>,
    ) -> SearchFilters {
        let inferred = match &self.extractor {
            Some(extractor) if !query.is_empty() => extractor.extract(query).await,
            _ => SearchFilters::default(),
        };
        match explicit {
            Some(explicit) => explicit.sanitized().merged_over(inferred),
            None => inferred,
        }
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, EmbeddingError> {
        if query.is_empty() {
            return Err(EmbeddingError::Unavailable("empty query".into()));
        }
        tokio::time::timeout(self.embed_timeout, self.embedder.embed(query))
            .await
            .map_err(|_| EmbeddingError::Timeout(self.embed_timeout))?
    }

    /// Runs one search. Only store failures are surfaced; query understanding and embedding
    /// failures degrade the result instead.
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, StoreError> {
        let query = request.query.trim().to_string();
        let limit = self.effective_limit(request.limit);
        let filters = self.effective_filters(&query, request.filters).await;
        debug!(?filters, limit, "effective search filters");

        let (vehicles, search_type) = match self.embed_query(&query).await {
            Ok(embedding) => (
                self.store
                    .search_semantic(&embedding, &filters, limit)
                    .await?,
                SearchType::Semantic,
            ),
            Err(err) => {
                warn!(error = %err, "query embedding failed; falling back to filters-only search");
                (
                    self.store.search_recent(&filters, limit).await?,
                    SearchType::FiltersOnly,
                )
            }
        };
        info!(
            results = vehicles.len(),
            search_type = ?search_type,
            "search complete"
        );
        Ok(SearchResponse {
            query,
            total_results: vehicles.len(),
            vehicles,
            search_type,
            extracted_filters: filters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::vehicle::{Source, VehicleListing};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct FixedEmbedder(Option<Vec<f32>>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            match &self.0 {
                Some(vector) => Ok(inputs.iter().map(|_| vector.clone()).collect()),
                None => Err(EmbeddingError::Unavailable("offline".into())),
            }
        }
    }

    async fn seeded_store(count: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for index in 0..count {
            let mut listing = VehicleListing::new(Source::TuCarro);
            listing.external_id = Some(format!("MLV{index}"));
            listing.brand = Some("Chevrolet".into());
            listing.price_usd = Some(5_000.0 + index as f64);
            store
                .upsert(&listing, Some(&[1.0, index as f32]))
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn search_type_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&SearchType::FiltersOnly).unwrap(),
            "\"filters-only\""
        );
        assert_eq!(
            serde_json::to_string(&SearchType::Semantic).unwrap(),
            "\"semantic\""
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn limit_defaults_and_clamps() {
        let store = seeded_store(30).await;
        let engine = HybridSearchEngine::new(
            Arc::new(FixedEmbedder(Some(vec![1.0, 0.0]))),
            store,
            None,
        );
        let response = engine.search(SearchRequest::new("chevrolet")).await.unwrap();
        assert_eq!(response.total_results, DEFAULT_LIMIT);
        let response = engine
            .search(SearchRequest::new("chevrolet").with_limit(0))
            .await
            .unwrap();
        assert_eq!(response.total_results, 1);
        let response = engine
            .search(SearchRequest::new("chevrolet").with_limit(500))
            .await
            .unwrap();
        assert_eq!(response.total_results, 30);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn falls_back_to_recency_without_embedding() {
        let store = seeded_store(3).await;
        let engine = HybridSearchEngine::new(Arc::new(FixedEmbedder(None)), store, None);
        let response = engine
            .search(SearchRequest::new("lo que sea").with_limit(2))
            .await
            .unwrap();
        assert_eq!(response.search_type, SearchType::FiltersOnly);
        assert_eq!(response.total_results, 2);
        assert!(response
            .vehicles
            .iter()
            .all(|hit| hit.similarity_score.is_none()));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_query_with_filters_lists_matching_vehicles() {
        let store = seeded_store(2).await;
        let mut toyota = VehicleListing::new(Source::Autocosmos);
        toyota.external_id = Some("AC-1".into());
        toyota.brand = Some("Toyota".into());
        toyota.price_usd = Some(20_000.0);
        store.upsert(&toyota, Some(&[1.0, 0.0])).await.unwrap();

        let engine = HybridSearchEngine::new(
            Arc::new(FixedEmbedder(Some(vec![1.0, 0.0]))),
            store,
            None,
        );
        let filters = SearchFilters {
            brand: Some("toyota".into()),
            ..SearchFilters::default()
        };
        let response = engine
            .search(SearchRequest::new("").with_filters(filters))
            .await
            .unwrap();
        assert_eq!(response.search_type, SearchType::FiltersOnly);
        assert_eq!(response.total_results, 1);
        assert_eq!(
            response.vehicles[0].vehicle.listing.brand.as_deref(),
            Some("Toyota")
        );
    }
}
