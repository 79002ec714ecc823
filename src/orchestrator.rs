//! Concurrent fetch pass over every enabled marketplace adapter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use reqwest::Client;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::controls::{SourceBudget, SourceControls};
use crate::error::FetchError;
use crate::sources::{adapter_for, normalize_page, PageCursor, SourceAdapter};
use crate::vehicle::{Source, VehicleListing};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; carcrawl/0.1; +https://github.com/carcrawl)";

/// Builds the HTTP client shared by every adapter of a run.
pub fn http_client(page_timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(page_timeout)
        .build()
}

/// What one source produced during a fetch pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceOutcome {
    /// Normalized, priced listings in page order.
    pub listings: Vec<VehicleListing>,
    /// Pages downloaded and parsed successfully.
    pub pages_fetched: u32,
    /// Pages that failed (transport, status, timeout or markup).
    pub pages_failed: u32,
    /// Cards dropped for lacking a price.
    pub dropped: usize,
    /// Last error observed for this source.
    pub error: Option<String>,
    /// True when the global deadline cut the source short.
    pub timed_out: bool,
}

impl SourceOutcome {
    /// True when the source yielded nothing and recorded an error.
    pub fn failed(&self) -> bool {
        self.listings.is_empty() && self.error.is_some()
    }
}

/// Result of a fetch pass: one outcome per launched source.
#[derive(Debug, Default)]
pub struct FetchReport {
    /// Outcome per source.
    pub outcomes: BTreeMap<Source, SourceOutcome>,
    /// Wall-clock duration of the pass.
    pub elapsed: Duration,
}

impl FetchReport {
    /// Total listings across sources.
    pub fn total_listings(&self) -> usize {
        self.outcomes.values().map(|o| o.listings.len()).sum()
    }

    /// Sources that produced nothing but an error.
    pub fn failed_sources(&self) -> Vec<Source> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.failed())
            .map(|(source, _)| *source)
            .collect()
    }

    /// Concatenates every source's listings, in source order.
    pub fn into_listings(self) -> Vec<VehicleListing> {
        self.outcomes
            .into_values()
            .flat_map(|outcome| outcome.listings)
            .collect()
    }
}

/// Runs a set of adapters concurrently with per-source isolation.
pub struct FetchOrchestrator {
    client: Client,
    controls: SourceControls,
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl FetchOrchestrator {
    /// Orchestrator over explicit adapters; adapters without a budget in `controls` are skipped.
    pub fn new(
        client: Client,
        controls: SourceControls,
        adapters: Vec<Arc<dyn SourceAdapter>>,
    ) -> Self {
        Self {
            client,
            controls,
            adapters,
        }
    }

    /// Orchestrator over the live adapters of every source enabled in `controls`.
    pub fn for_live_sources(client: Client, controls: SourceControls) -> Self {
        let adapters = controls.launch_order().into_iter().map(adapter_for).collect();
        Self::new(client, controls, adapters)
    }

    /// Fetches every source and collects partial results. Never fails as a whole.
    pub async fn run(&self) -> FetchReport {
        let started = Instant::now();
        let deadline = started + self.controls.deadline();
        let metrics = Arc::new(Metrics::default());

        let order = self.controls.launch_order();
        let mut scheduled: Vec<_> = self
            .adapters
            .iter()
            .filter_map(|adapter| {
                let source = adapter.source();
                let budget = self.controls.budget(source)?;
                let rank = order.iter().position(|s| *s == source)?;
                Some((rank, source, budget, Arc::clone(adapter)))
            })
            .collect();
        scheduled.sort_by_key(|(rank, ..)| *rank);

        let mut sources = Vec::with_capacity(scheduled.len());
        let mut handles = Vec::with_capacity(scheduled.len());
        for (_, source, budget, adapter) in scheduled {
            info!(%source, tier = budget.tier(), max_pages = budget.max_pages(), "launching source");
            let task = SourceTask {
                adapter,
                client: self.client.clone(),
                budget,
                page_delay: self.controls.page_delay(),
                page_timeout: self.controls.page_timeout(),
                deadline,
                metrics: Arc::clone(&metrics),
            };
            sources.push(source);
            handles.push(tokio::spawn(task.run()));
        }

        let mut outcomes = BTreeMap::new();
        for (source, joined) in sources.into_iter().zip(join_all(handles).await) {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(%source, error = %err, "source task aborted");
                    metrics.record_failed_source();
                    SourceOutcome {
                        error: Some(format!("source task aborted: {err}")),
                        ..SourceOutcome::default()
                    }
                }
            };
            outcomes.insert(source, outcome);
        }

        let elapsed = started.elapsed();
        metrics.report(elapsed);
        FetchReport { outcomes, elapsed }
    }
}

struct SourceTask {
    adapter: Arc<dyn SourceAdapter>,
    client: Client,
    budget: SourceBudget,
    page_delay: Duration,
    page_timeout: Duration,
    deadline: Instant,
    metrics: Arc<Metrics>,
}

impl SourceTask {
    async fn run(self) -> SourceOutcome {
        let source = self.adapter.source();
        let mut outcome = SourceOutcome::default();
        let mut cursor = PageCursor::first();

        for index in 0..self.budget.max_pages() {
            if index > 0
                && !self.page_delay.is_zero()
                && timeout_at(self.deadline, sleep(self.page_delay)).await.is_err()
            {
                self.mark_timed_out(&mut outcome);
                break;
            }

            let fetched = timeout_at(
                self.deadline,
                self.adapter
                    .fetch_page(&self.client, cursor, self.page_timeout),
            )
            .await;
            match fetched {
                Err(_) => {
                    self.mark_timed_out(&mut outcome);
                    break;
                }
                Ok(Ok(raws)) if raws.is_empty() => {
                    outcome.pages_fetched += 1;
                    self.metrics.record_page_fetched();
                    debug!(%source, page = cursor.page(), "empty page, stopping");
                    break;
                }
                Ok(Ok(raws)) => {
                    outcome.pages_fetched += 1;
                    self.metrics.record_page_fetched();
                    let page = normalize_page(self.adapter.as_ref(), raws);
                    debug!(
                        %source,
                        page = cursor.page(),
                        listings = page.listings.len(),
                        dropped = page.dropped,
                        "page parsed"
                    );
                    self.metrics.record_listings(page.listings.len(), page.dropped);
                    outcome.dropped += page.dropped;
                    outcome.listings.extend(page.listings);
                }
                Ok(Err(err)) => {
                    outcome.pages_failed += 1;
                    self.metrics.record_error(&err);
                    warn!(%source, page = cursor.page(), kind = err.kind(), error = %err, "page failed");
                    outcome.error = Some(err.to_string());
                }
            }
            cursor = cursor.next();
        }

        if outcome.failed() {
            self.metrics.record_failed_source();
        }
        info!(
            %source,
            listings = outcome.listings.len(),
            pages_fetched = outcome.pages_fetched,
            pages_failed = outcome.pages_failed,
            dropped = outcome.dropped,
            "source finished"
        );
        outcome
    }

    fn mark_timed_out(&self, outcome: &mut SourceOutcome) {
        warn!(source = %self.adapter.source(), "fetch deadline reached");
        outcome.timed_out = true;
        outcome.error = Some("fetch deadline exceeded".to_string());
    }
}

#[derive(Default)]
struct Metrics {
    pages_fetched: AtomicUsize,
    listings: AtomicUsize,
    dropped: AtomicUsize,
    failed_sources: AtomicUsize,
    http_errors: AtomicUsize,
    status_errors: AtomicUsize,
    timeouts: AtomicUsize,
    markup_errors: AtomicUsize,
}

impl Metrics {
    fn record_page_fetched(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_listings(&self, kept: usize, dropped: usize) {
        self.listings.fetch_add(kept, Ordering::Relaxed);
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    fn record_failed_source(&self) {
        self.failed_sources.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, err: &FetchError) {
        let counter = match err {
            FetchError::Http { .. } => &self.http_errors,
            FetchError::Status { .. } => &self.status_errors,
            FetchError::Timeout { .. } => &self.timeouts,
            FetchError::Markup { .. } => &self.markup_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f32().max(f32::EPSILON);
        let pages = self.pages_fetched.load(Ordering::Relaxed);
        info!(
            elapsed_secs = secs,
            pages_fetched = pages,
            pages_per_sec = pages as f32 / secs,
            listings = self.listings.load(Ordering::Relaxed),
            dropped_unpriced = self.dropped.load(Ordering::Relaxed),
            failed_sources = self.failed_sources.load(Ordering::Relaxed),
            http_errors = self.http_errors.load(Ordering::Relaxed),
            status_errors = self.status_errors.load(Ordering::Relaxed),
            timeouts = self.timeouts.load(Ordering::Relaxed),
            markup_errors = self.markup_errors.load(Ordering::Relaxed),
            "fetch pass finished"
        );
    }
}
