//! One ingestion cycle: fetch every source, dedupe, embed and store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dedup::{dedupe, DedupReport};
use crate::error::StoreError;
use crate::indexer::{EmbeddingIndexer, IndexReport};
use crate::orchestrator::{FetchOrchestrator, SourceOutcome};
use crate::store::VehicleStore;
use crate::vehicle::Source;

/// Per-source counters, without the listings themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    /// Priced listings produced.
    pub listings: usize,
    /// Pages parsed successfully.
    pub pages_fetched: u32,
    /// Pages that failed.
    pub pages_failed: u32,
    /// Cards dropped for lacking a price.
    pub dropped: usize,
    /// Last error seen, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Cut short by the global deadline.
    pub timed_out: bool,
}

impl SourceSummary {
    /// Every page was read, without errors, before the deadline.
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.pages_failed == 0 && !self.timed_out
    }
}

impl From<&SourceOutcome> for SourceSummary {
    fn from(outcome: &SourceOutcome) -> Self {
        Self {
            listings: outcome.listings.len(),
            pages_fetched: outcome.pages_fetched,
            pages_failed: outcome.pages_failed,
            dropped: outcome.dropped,
            error: outcome.error.clone(),
            timed_out: outcome.timed_out,
        }
    }
}

/// Everything an ingestion cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    /// Counters per launched source.
    pub sources: BTreeMap<Source, SourceSummary>,
    /// Cross-source dedup counts.
    pub dedup: DedupReport,
    /// Store writes and embedding failures.
    pub index: IndexReport,
    /// Rows soft-deleted by the staleness sweep.
    pub deactivated: u64,
    /// Wall-clock duration of the cycle.
    pub elapsed_ms: u64,
}

impl IngestReport {
    /// Listings fetched across all sources, before dedup.
    pub fn fetched(&self) -> usize {
        self.sources.values().map(|summary| summary.listings).sum()
    }
}

/// Fetch, dedupe and index, optionally followed by a staleness sweep.
pub struct IngestPipeline {
    orchestrator: FetchOrchestrator,
    indexer: EmbeddingIndexer,
    reconcile: Option<(Arc<dyn VehicleStore>, chrono::Duration)>,
}

impl IngestPipeline {
    /// Pipeline feeding `indexer` from `orchestrator`.
    pub fn new(orchestrator: FetchOrchestrator, indexer: EmbeddingIndexer) -> Self {
        Self {
            orchestrator,
            indexer,
            reconcile: None,
        }
    }

    /// After each cycle, deactivate rows of `store` not refreshed within `max_age`. Only
    /// sources that were read completely and fully stored are swept.
    pub fn with_deactivation(
        mut self,
        store: Arc<dyn VehicleStore>,
        max_age: chrono::Duration,
    ) -> Self {
        self.reconcile = Some((store, max_age));
        self
    }

    /// Runs one cycle. Source and embedding failures are reported; only store failures abort.
    pub async fn run(&self) -> Result<IngestReport, StoreError> {
        let started = Instant::now();
        let cycle_start = Utc::now();

        let fetch = self.orchestrator.run().await;
        let sources: BTreeMap<Source, SourceSummary> = fetch
            .outcomes
            .iter()
            .map(|(source, outcome)| (*source, SourceSummary::from(outcome)))
            .collect();
        for source in fetch.failed_sources() {
            warn!(%source, "source produced no listings this cycle");
        }

        let (unique, dedup) = dedupe(fetch.into_listings());
        info!(
            input = dedup.input,
            output = dedup.output,
            removed = dedup.removed,
            "deduplicated listings"
        );

        let index = self.indexer.index(&unique).await?;

        let mut deactivated = 0;
        if let Some((store, max_age)) = &self.reconcile {
            let cutoff = cycle_start - *max_age;
            for (source, summary) in &sources {
                let skipped = index
                    .failures
                    .iter()
                    .any(|failure| failure.source == *source);
                if !summary.is_complete() || skipped {
                    warn!(%source, "incomplete refresh; keeping its listings active");
                    continue;
                }
                let removed = store.deactivate_stale(*source, cutoff).await?;
                debug!(%source, removed, "deactivated stale listings");
                deactivated += removed;
            }
            info!(deactivated, "staleness sweep finished");
        }

        let report = IngestReport {
            sources,
            dedup,
            index,
            deactivated,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        info!(
            fetched = report.fetched(),
            stored = report.index.stored(),
            failed = report.index.failures.len(),
            elapsed_ms = report.elapsed_ms,
            "ingestion cycle complete"
        );
        Ok(report)
    }
}
