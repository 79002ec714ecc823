#![warn(missing_docs)]
//! Core library for carcrawl: scrapes vehicle marketplaces into one pgvector-backed catalog and
//! answers conversational searches over it.
//!
//! Ingestion runs [`FetchOrchestrator`] → [`dedup::dedupe`] → [`EmbeddingIndexer`], wrapped by
//! [`IngestPipeline`]. Search goes through [`HybridSearchEngine`].

pub mod controls;
pub mod dedup;
pub mod embedder;
pub mod error;
pub mod extract;
pub mod filters;
pub mod indexer;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod query;
pub mod search;
pub mod sources;
pub mod store;
pub mod vehicle;

pub use controls::{ControlArgs, SourceBudget, SourceControls};
pub use embedder::{CachedEmbedder, Embedder, OpenAiEmbedder, UnavailableEmbedder};
pub use error::{EmbeddingError, FetchError, QueryUnderstandingError, StoreError};
pub use filters::SearchFilters;
pub use indexer::{EmbeddingIndexer, IndexReport, ReembedReport};
pub use llm::{AnthropicProvider, LlmProvider, OpenAiProvider, ProviderRequest};
pub use orchestrator::{FetchOrchestrator, FetchReport, SourceOutcome};
pub use pipeline::{IngestPipeline, IngestReport};
pub use query::FilterExtractor;
pub use search::{HybridSearchEngine, SearchRequest, SearchResponse, SearchType};
pub use sources::{PageCursor, RawListing, SourceAdapter};
pub use store::{MemoryStore, PgVehicleStore, TableName, UpsertOutcome, VehicleStore};
pub use vehicle::{RankedVehicle, Source, StoredVehicle, VehicleListing};
