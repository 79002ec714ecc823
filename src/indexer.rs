//! Embeds canonical listings and writes them to the catalog.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedder::Embedder;
use crate::error::{EmbeddingError, StoreError};
use crate::store::{UpsertOutcome, VehicleStore};
use crate::vehicle::{Source, VehicleListing};

/// Characters of the description kept in the embedding text.
pub const DESCRIPTION_LIMIT: usize = 500;

/// Text submitted to the embedding model for `listing`: one `label: value` line per known
/// attribute, in a fixed order.
pub fn render_embedding_text(listing: &VehicleListing) -> String {
    let mut lines: Vec<String> = Vec::with_capacity(10);
    if let Some(brand) = &listing.brand {
        lines.push(format!("Marca: {brand}"));
    }
    if let Some(model) = &listing.model {
        lines.push(format!("Modelo: {model}"));
    }
    if let Some(year) = listing.year {
        lines.push(format!("Año: {year}"));
    }
    match (listing.price_usd, listing.price_local) {
        (Some(usd), _) => lines.push(format!("Precio: ${} USD", group_thousands(usd))),
        (None, Some(local)) => lines.push(format!("Precio: Bs. {}", group_thousands(local))),
        (None, None) => {}
    }
    if let Some(transmission) = &listing.transmission {
        lines.push(format!("Transmisión: {transmission}"));
    }
    if let Some(fuel_type) = &listing.fuel_type {
        lines.push(format!("Combustible: {fuel_type}"));
    }
    if let Some(color) = &listing.color {
        lines.push(format!("Color: {color}"));
    }
    if let Some(location) = &listing.location {
        lines.push(format!("Ubicación: {location}"));
    }
    if let Some(mileage) = listing.mileage {
        lines.push(format!("Kilometraje: {} km", group_thousands(mileage as f64)));
    }
    if let Some(description) = &listing.description {
        let truncated: String = description.chars().take(DESCRIPTION_LIMIT).collect();
        lines.push(format!("Descripción: {truncated}"));
    }
    lines.join("\n")
}

fn group_thousands(value: f64) -> String {
    let digits = format!("{:.0}", value.abs());
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    if value < 0.0 {
        grouped.push('-');
    }
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

/// A listing skipped because its embedding could not be computed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexFailure {
    /// Source of the skipped listing.
    pub source: Source,
    /// External id, when known.
    pub external_id: Option<String>,
    /// Embedding error, rendered.
    pub error: String,
}

/// Outcome of indexing one batch of canonical listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexReport {
    /// Rows created.
    pub inserted: usize,
    /// Existing rows refreshed.
    pub updated: usize,
    /// Stored rows, counted in `inserted`/`updated`, written without a vector.
    pub unembedded: usize,
    /// Listings skipped for this cycle.
    pub failures: Vec<IndexFailure>,
}

impl IndexReport {
    /// Listings written to the store.
    pub fn stored(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Outcome of a re-embedding sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReembedReport {
    /// Rows that received a fresh vector.
    pub embedded: usize,
    /// Rows whose embedding failed again.
    pub failed: usize,
}

/// Embeds listings and upserts them, one record at a time.
#[derive(Clone)]
pub struct EmbeddingIndexer {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VehicleStore>,
    timeout: Duration,
    store_unembedded: bool,
}

impl EmbeddingIndexer {
    /// Indexer writing to `store`; each embedding call is bounded by `timeout`.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VehicleStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            store,
            timeout,
            store_unembedded: false,
        }
    }

    /// Store listings whose embedding failed with a NULL vector instead of skipping them.
    /// A later [`reembed_missing`](Self::reembed_missing) sweep fills them in.
    pub fn with_unembedded_writes(mut self, enabled: bool) -> Self {
        self.store_unembedded = enabled;
        self
    }

    async fn embed(&self, listing: &VehicleListing) -> Result<Vec<f32>, EmbeddingError> {
        let text = render_embedding_text(listing);
        tokio::time::timeout(self.timeout, self.embedder.embed(&text))
            .await
            .map_err(|_| EmbeddingError::Timeout(self.timeout))?
    }

    /// Embeds and stores every listing. Embedding failures skip the record, unless unembedded
    /// writes are enabled; store failures abort the batch.
    pub async fn index(&self, listings: &[VehicleListing]) -> Result<IndexReport, StoreError> {
        let mut report = IndexReport::default();
        for (position, listing) in listings.iter().enumerate() {
            let embedding = match self.embed(listing).await {
                Ok(embedding) => Some(embedding),
                Err(err) if self.store_unembedded => {
                    debug!(
                        source = %listing.source,
                        external_id = ?listing.external_id,
                        error = %err,
                        "storing listing without embedding"
                    );
                    report.unembedded += 1;
                    None
                }
                Err(err) => {
                    warn!(
                        source = %listing.source,
                        external_id = ?listing.external_id,
                        error = %err,
                        "embedding failed; listing skipped until next cycle"
                    );
                    report.failures.push(IndexFailure {
                        source: listing.source,
                        external_id: listing.external_id.clone(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            match self.store.upsert(listing, embedding.as_deref()).await? {
                UpsertOutcome::Inserted(id) => {
                    report.inserted += 1;
                    debug!(id, source = %listing.source, "inserted listing");
                }
                UpsertOutcome::Updated(id) => {
                    report.updated += 1;
                    debug!(id, source = %listing.source, "updated listing");
                }
            }
            if (position + 1) % 100 == 0 {
                info!(processed = position + 1, total = listings.len(), "indexing progress");
            }
        }
        info!(
            inserted = report.inserted,
            updated = report.updated,
            unembedded = report.unembedded,
            failed = report.failures.len(),
            "indexing finished"
        );
        Ok(report)
    }

    /// Fills in vectors for active rows that lack one, `batch_size` rows at a time. The sweep
    /// stops after the first batch with a failure so a persistently failing row cannot spin it.
    pub async fn reembed_missing(&self, batch_size: usize) -> Result<ReembedReport, StoreError> {
        let batch_size = batch_size.max(1);
        let mut report = ReembedReport::default();
        loop {
            let pending = self.store.missing_embeddings(batch_size).await?;
            if pending.is_empty() {
                break;
            }
            let mut batch_failed = 0;
            for vehicle in &pending {
                match self.embed(&vehicle.listing).await {
                    Ok(embedding) => {
                        self.store.set_embedding(vehicle.id, &embedding).await?;
                        report.embedded += 1;
                    }
                    Err(err) => {
                        warn!(id = vehicle.id, error = %err, "re-embedding failed");
                        batch_failed += 1;
                    }
                }
            }
            report.failed += batch_failed;
            if batch_failed > 0 || pending.len() < batch_size {
                break;
            }
        }
        info!(
            embedded = report.embedded,
            failed = report.failed,
            "re-embedding sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every `fail_every`-th call (1-based); 0 never fails.
    struct FlakyEmbedder {
        calls: AtomicUsize,
        fail_every: usize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every > 0 && call % self.fail_every == 0 {
                return Err(EmbeddingError::Unavailable("flaky".into()));
            }
            Ok(inputs.iter().map(|text| vec![text.len() as f32, 1.0]).collect())
        }
    }

    fn car(id: &str, brand: &str) -> VehicleListing {
        let mut listing = VehicleListing::new(Source::TuCarro);
        listing.external_id = Some(id.into());
        listing.brand = Some(brand.into());
        listing.price_usd = Some(10_000.0);
        listing
    }

    #[test]
    fn renders_fields_in_fixed_order() {
        let mut listing = VehicleListing::new(Source::Autocosmos);
        listing.brand = Some("Toyota".into());
        listing.model = Some("4Runner".into());
        listing.year = Some(2019);
        listing.price_usd = Some(38_500.0);
        listing.mileage = Some(45_000);
        listing.location = Some("Caracas".into());
        listing.description = Some("x".repeat(600));
        let text = render_embedding_text(&listing);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            &lines[..6],
            &[
                "Marca: Toyota",
                "Modelo: 4Runner",
                "Año: 2019",
                "Precio: $38,500 USD",
                "Ubicación: Caracas",
                "Kilometraje: 45,000 km",
            ]
        );
        assert_eq!(lines[6].chars().count(), "Descripción: ".chars().count() + 500);
    }

    #[test]
    fn local_price_used_without_usd() {
        let mut listing = VehicleListing::new(Source::MercadoLibre);
        listing.price_local = Some(1_450_000.0);
        assert_eq!(render_embedding_text(&listing), "Precio: Bs. 1,450,000");
        assert_eq!(group_thousands(999.0), "999");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn embedding_failures_skip_records() {
        let store = Arc::new(MemoryStore::new());
        let indexer = EmbeddingIndexer::new(
            Arc::new(FlakyEmbedder {
                calls: AtomicUsize::new(0),
                fail_every: 2,
            }),
            store.clone(),
            Duration::from_secs(1),
        );
        let report = indexer
            .index(&[car("a", "Kia"), car("b", "Ford"), car("c", "Fiat")])
            .await
            .unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].external_id.as_deref(), Some("b"));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unembedded_writes_keep_failed_records() {
        let store = Arc::new(MemoryStore::new());
        let indexer = EmbeddingIndexer::new(
            Arc::new(FlakyEmbedder {
                calls: AtomicUsize::new(0),
                fail_every: 1,
            }),
            store.clone(),
            Duration::from_secs(1),
        )
        .with_unembedded_writes(true);
        let report = indexer
            .index(&[car("a", "Kia"), car("b", "Ford")])
            .await
            .unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.unembedded, 2);
        assert!(report.failures.is_empty());
        assert_eq!(store.missing_embeddings(10).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reindexing_updates_in_place() {
        let store = Arc::new(MemoryStore::new());
        let indexer = EmbeddingIndexer::new(
            Arc::new(FlakyEmbedder {
                calls: AtomicUsize::new(0),
                fail_every: 0,
            }),
            store.clone(),
            Duration::from_secs(1),
        );
        let batch = [car("a", "Kia"), car("b", "Ford")];
        indexer.index(&batch).await.unwrap();
        let second = indexer.index(&batch).await.unwrap();
        assert_eq!(second.updated, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sweep_fills_missing_vectors() {
        let store = Arc::new(MemoryStore::new());
        for id in ["a", "b", "c"] {
            store.upsert(&car(id, "Jeep"), None).await.unwrap();
        }
        let indexer = EmbeddingIndexer::new(
            Arc::new(FlakyEmbedder {
                calls: AtomicUsize::new(0),
                fail_every: 0,
            }),
            store.clone(),
            Duration::from_secs(1),
        );
        let report = indexer.reembed_missing(2).await.unwrap();
        assert_eq!(report, ReembedReport { embedded: 3, failed: 0 });
        assert!(store.missing_embeddings(10).await.unwrap().is_empty());
    }
}
