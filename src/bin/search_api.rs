use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use carcrawl::embedder::EmbeddingArgs;
use carcrawl::orchestrator::http_client;
use carcrawl::store::StoreArgs;
use carcrawl::vehicle::{CatalogStats, Facet};
use carcrawl::{
    AnthropicProvider, CachedEmbedder, ControlArgs, EmbeddingIndexer, FetchOrchestrator,
    FilterExtractor, HybridSearchEngine, IngestPipeline, IngestReport, LlmProvider,
    OpenAiProvider, SearchRequest, SearchResponse, StoreError, StoredVehicle,
    VehicleStore,
};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LlmKind {
    Anthropic,
    Openai,
    /// Skip query understanding; only explicit filters apply.
    None,
}

#[derive(Parser, Debug)]
#[command(
    name = "carcrawl-api",
    about = "HTTP API for conversational vehicle search over the carcrawl catalog"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "CARCRAWL_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    controls: ControlArgs,

    /// Language model used to infer filters from the query.
    #[arg(long, env = "CARCRAWL_LLM", value_enum, default_value_t = LlmKind::Anthropic)]
    llm: LlmKind,

    /// Model identifier for the selected language model.
    #[arg(long, env = "CARCRAWL_LLM_MODEL")]
    llm_model: Option<String>,

    /// Anthropic API key; without one, --llm anthropic falls back to explicit filters only.
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_api_key: Option<String>,

    /// Seconds before a filter-extraction call is abandoned.
    #[arg(long, env = "CARCRAWL_LLM_TIMEOUT_SECS", default_value_t = 20)]
    llm_timeout_secs: u64,

    /// Result count when the client does not override it.
    #[arg(long, default_value_t = 20)]
    default_limit: usize,

    /// Maximum result count allowed per request.
    #[arg(long, default_value_t = 100)]
    max_limit: usize,

    /// Max cached query embeddings kept in-memory (0 disables caching).
    #[arg(long, default_value_t = 1024)]
    embedding_cache_size: usize,

    /// Max requests per minute allowed (0 disables rate limiting).
    #[arg(long, default_value_t = 120)]
    max_requests_per_minute: u32,

    /// Rate-limit burst size (tokens available instantly).
    #[arg(long, default_value_t = 12)]
    rate_limit_burst: u32,

    /// Soft-delete listings not refreshed for this many hours after each ingest.
    #[arg(long, env = "CARCRAWL_DEACTIVATE_AFTER_HOURS")]
    deactivate_after_hours: Option<u32>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<HybridSearchEngine>,
    store: Arc<dyn VehicleStore>,
    pipeline: Arc<IngestPipeline>,
    ingest_lock: Arc<Mutex<()>>,
    rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn build_extractor(cli: &ApiCli) -> Result<Option<FilterExtractor>> {
    let timeout = Duration::from_secs(cli.llm_timeout_secs.max(1));
    let provider: Arc<dyn LlmProvider> = match cli.llm {
        LlmKind::None => return Ok(None),
        LlmKind::Anthropic => {
            let Some(key) = non_blank(cli.anthropic_api_key.as_deref()) else {
                warn!("no Anthropic API key configured; skipping query understanding");
                return Ok(None);
            };
            let model = cli
                .llm_model
                .clone()
                .unwrap_or_else(|| "claude-3-5-sonnet-20241022".to_string());
            Arc::new(AnthropicProvider::new(key.to_string(), model, timeout)?)
        }
        LlmKind::Openai => {
            let Some(key) = cli.embedding.api_key() else {
                warn!("no OpenAI API key configured; skipping query understanding");
                return Ok(None);
            };
            let model = cli
                .llm_model
                .clone()
                .unwrap_or_else(|| "gpt-4o-mini".to_string());
            Arc::new(
                OpenAiProvider::new(key.to_string(), model, timeout)?
                    .with_base_url(&cli.embedding.openai_base_url),
            )
        }
    };
    Ok(Some(FilterExtractor::new(provider, timeout)))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ApiCli::parse();
    init_logging(cli.verbose);

    let store: Arc<dyn VehicleStore> = Arc::new(
        cli.store
            .connect(Some(cli.embedding.embedding_dims))
            .await?,
    );
    let embedder = cli.embedding.build_embedder()?;
    let extractor = build_extractor(&cli)?;
    if extractor.is_none() {
        warn!("query understanding disabled; only explicit filters apply");
    }

    let engine = HybridSearchEngine::new(
        CachedEmbedder::wrap(embedder.clone(), cli.embedding_cache_size),
        store.clone(),
        extractor,
    )
    .with_embed_timeout(cli.embedding.timeout())
    .with_limits(cli.default_limit, cli.max_limit);

    let controls = cli.controls.build_controls();
    let client =
        http_client(controls.page_timeout()).context("failed to build marketplace HTTP client")?;
    let mut pipeline = IngestPipeline::new(
        FetchOrchestrator::for_live_sources(client, controls),
        EmbeddingIndexer::new(embedder, store.clone(), cli.embedding.timeout()),
    );
    if let Some(hours) = cli.deactivate_after_hours {
        pipeline =
            pipeline.with_deactivation(store.clone(), chrono::Duration::hours(hours.into()));
    }

    let state = AppState {
        engine: Arc::new(engine),
        store,
        pipeline: Arc::new(pipeline),
        ingest_lock: Arc::new(Mutex::new(())),
        rate_limiter: RateLimiter::new(cli.max_requests_per_minute, cli.rate_limit_burst),
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/search", post(search_handler))
        .route("/v1/ingest", post(ingest_handler))
        .route("/v1/vehicles/{id}", get(vehicle_handler))
        .route("/v1/brands", get(brands_handler))
        .route("/v1/models/{brand}", get(models_handler))
        .route("/v1/stats", get(stats_handler))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    info!(%addr, "carcrawl-api listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn search_handler(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    validate_query(&request)?;
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.acquire().await {
            return Err(too_many_requests("rate limit exceeded"));
        }
    }
    let response = state.engine.search(request).await.map_err(store_error)?;
    Ok(Json(response))
}

async fn ingest_handler(State(state): State<AppState>) -> Result<Json<IngestReport>, ApiError> {
    let Ok(_guard) = state.ingest_lock.try_lock() else {
        return Err(error_body(
            StatusCode::CONFLICT,
            "an ingestion cycle is already running",
        ));
    };
    let report = state.pipeline.run().await.map_err(store_error)?;
    Ok(Json(report))
}

async fn vehicle_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StoredVehicle>, ApiError> {
    match state.store.get(id).await.map_err(store_error)? {
        Some(vehicle) => Ok(Json(vehicle)),
        None => Err(store_error(StoreError::NotFound(id))),
    }
}

async fn brands_handler(State(state): State<AppState>) -> Result<Json<Vec<Facet>>, ApiError> {
    Ok(Json(state.store.brands().await.map_err(store_error)?))
}

async fn models_handler(
    State(state): State<AppState>,
    Path(brand): Path<String>,
) -> Result<Json<Vec<Facet>>, ApiError> {
    Ok(Json(state.store.models(&brand).await.map_err(store_error)?))
}

async fn stats_handler(State(state): State<AppState>) -> Result<Json<CatalogStats>, ApiError> {
    Ok(Json(state.store.stats().await.map_err(store_error)?))
}

/// A blank query is accepted only when explicit filters narrow the catalog.
fn validate_query(request: &SearchRequest) -> Result<(), ApiError> {
    let has_filters = request
        .filters
        .clone()
        .is_some_and(|filters| !filters.sanitized().is_empty());
    if request.query.trim().is_empty() && !has_filters {
        return Err(bad_request("query text or filters are required"));
    }
    Ok(())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    error_body(StatusCode::BAD_REQUEST, message)
}

fn too_many_requests(message: impl Into<String>) -> ApiError {
    error_body(StatusCode::TOO_MANY_REQUESTS, message)
}

fn internal_error(err: impl Display) -> ApiError {
    error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound(id) => {
            error_body(StatusCode::NOT_FOUND, format!("vehicle {id} not found"))
        }
        other => {
            warn!(error = %other, "store failure");
            internal_error(other)
        }
    }
}

#[derive(Clone)]
struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(max_per_minute: u32, burst: u32) -> Option<Self> {
        if max_per_minute == 0 || burst == 0 {
            return None;
        }
        let capacity = burst as f64;
        let refill_per_sec = max_per_minute as f64 / 60.0;
        Some(Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity,
            refill_per_sec,
        })
    }

    async fn acquire(&self) -> bool {
        let mut guard = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
        guard.last_refill = now;
        guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if guard.tokens >= 1.0 {
            guard.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carcrawl::SearchFilters;

    #[test]
    fn zero_rate_disables_limiting() {
        assert!(RateLimiter::new(0, 10).is_none());
        assert!(RateLimiter::new(60, 0).is_none());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn burst_is_spent_then_refilled() {
        let limiter = RateLimiter::new(60, 2).unwrap();
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.acquire().await);
    }

    #[test]
    fn blank_query_needs_filters() {
        let (status, _) = validate_query(&SearchRequest::new("  ")).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let blank_filters = SearchFilters {
            brand: Some("   ".into()),
            ..SearchFilters::default()
        };
        let request = SearchRequest::new("").with_filters(blank_filters);
        assert!(validate_query(&request).is_err());

        let brand = SearchFilters {
            brand: Some("Toyota".into()),
            ..SearchFilters::default()
        };
        assert!(validate_query(&SearchRequest::new("").with_filters(brand)).is_ok());
        assert!(validate_query(&SearchRequest::new("camioneta")).is_ok());
    }

    #[test]
    fn missing_llm_key_disables_extraction() {
        let cli = ApiCli::try_parse_from([
            "carcrawl-api",
            "--anthropic-api-key",
            "",
            "--openai-api-key",
            "",
        ])
        .unwrap();
        assert!(matches!(cli.llm, LlmKind::Anthropic));
        assert!(build_extractor(&cli).unwrap().is_none());

        let cli = ApiCli::try_parse_from([
            "carcrawl-api",
            "--llm",
            "openai",
            "--openai-api-key",
            " ",
        ])
        .unwrap();
        assert!(build_extractor(&cli).unwrap().is_none());
    }

    #[test]
    fn missing_vehicle_maps_to_not_found() {
        let (status, _) = store_error(StoreError::NotFound(7));
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = store_error(StoreError::Decode("bad row".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
