use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{UpsertOutcome, VehicleStore};
use crate::error::StoreError;
use crate::filters::SearchFilters;
use crate::vehicle::{
    CatalogStats, Facet, RankedVehicle, Source, StoredVehicle, VehicleListing,
};

struct Row {
    vehicle: StoredVehicle,
    embedding: Option<Vec<f32>>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    rows: Vec<Row>,
}

/// In-process catalog with exact cosine ranking.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows, active or not.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    /// True when nothing has been stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stored embedding of row `id`, if any.
    pub async fn embedding_of(&self, id: i64) -> Option<Vec<f32>> {
        let inner = self.inner.lock().await;
        inner
            .rows
            .iter()
            .find(|row| row.vehicle.id == id)
            .and_then(|row| row.embedding.clone())
    }

    /// Overrides `updated_at` of row `id`; used to age rows in tests and dry runs.
    pub async fn touch(&self, id: i64, updated_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .rows
            .iter_mut()
            .find(|row| row.vehicle.id == id)
            .ok_or(StoreError::NotFound(id))?;
        row.vehicle.updated_at = updated_at;
        Ok(())
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f64, StoreError> {
    if a.len() != b.len() {
        return Err(StoreError::Decode(format!(
            "different vector dimensions {} and {}",
            a.len(),
            b.len()
        )));
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(1.0);
    }
    Ok(1.0 - dot / (norm_a.sqrt() * norm_b.sqrt()))
}

fn facets(values: impl Iterator<Item = String>) -> Vec<Facet> {
    let mut counts: BTreeMap<String, i64> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_default() += 1;
    }
    let mut facets: Vec<Facet> = counts
        .into_iter()
        .map(|(value, count)| Facet { value, count })
        .collect();
    facets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    facets
}

#[async_trait]
impl VehicleStore for MemoryStore {
    async fn upsert(
        &self,
        listing: &VehicleListing,
        embedding: Option<&[f32]>,
    ) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        if let Some(external_id) = listing.external_id() {
            let existing = inner.rows.iter_mut().find(|row| {
                row.vehicle.listing.source == listing.source
                    && row.vehicle.listing.external_id() == Some(external_id)
            });
            if let Some(row) = existing {
                let stored = &mut row.vehicle.listing;
                stored.price_usd = listing.price_usd;
                stored.price_local = listing.price_local;
                stored.mileage = listing.mileage;
                stored.description = listing.description.clone();
                stored.images = listing.images.clone();
                if let Some(vector) = embedding {
                    row.embedding = Some(vector.to_vec());
                }
                row.vehicle.updated_at = now;
                row.vehicle.is_active = true;
                return Ok(UpsertOutcome::Updated(row.vehicle.id));
            }
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.rows.push(Row {
            vehicle: StoredVehicle {
                id,
                listing: listing.clone(),
                is_active: true,
                scraped_at: now,
                updated_at: now,
            },
            embedding: embedding.map(<[f32]>::to_vec),
        });
        Ok(UpsertOutcome::Inserted(id))
    }

    async fn search_semantic(
        &self,
        embedding: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<RankedVehicle>, StoreError> {
        let inner = self.inner.lock().await;
        let mut scored = Vec::new();
        for row in inner
            .rows
            .iter()
            .filter(|row| row.vehicle.is_active && filters.matches(&row.vehicle.listing))
        {
            let Some(vector) = row.embedding.as_deref().filter(|v| !v.is_empty()) else {
                continue;
            };
            scored.push((cosine_distance(embedding, vector)?, &row.vehicle));
        }
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(distance, vehicle)| RankedVehicle::from_distance(vehicle.clone(), distance))
            .collect())
    }

    async fn search_recent(
        &self,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<RankedVehicle>, StoreError> {
        let inner = self.inner.lock().await;
        let mut matching: Vec<&StoredVehicle> = inner
            .rows
            .iter()
            .map(|row| &row.vehicle)
            .filter(|vehicle| vehicle.is_active && filters.matches(&vehicle.listing))
            .collect();
        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| b.id.cmp(&a.id)));
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|vehicle| RankedVehicle::unranked(vehicle.clone()))
            .collect())
    }

    async fn missing_embeddings(&self, limit: usize) -> Result<Vec<StoredVehicle>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .iter()
            .filter(|row| {
                row.vehicle.is_active && row.embedding.as_ref().is_none_or(|v| v.is_empty())
            })
            .take(limit)
            .map(|row| row.vehicle.clone())
            .collect())
    }

    async fn set_embedding(&self, id: i64, embedding: &[f32]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .rows
            .iter_mut()
            .find(|row| row.vehicle.id == id)
            .ok_or(StoreError::NotFound(id))?;
        row.embedding = Some(embedding.to_vec());
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<StoredVehicle>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .iter()
            .find(|row| row.vehicle.id == id && row.vehicle.is_active)
            .map(|row| row.vehicle.clone()))
    }

    async fn brands(&self) -> Result<Vec<Facet>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(facets(
            inner
                .rows
                .iter()
                .filter(|row| row.vehicle.is_active)
                .filter_map(|row| row.vehicle.listing.brand.clone()),
        ))
    }

    async fn models(&self, brand: &str) -> Result<Vec<Facet>, StoreError> {
        let wanted = brand.to_lowercase();
        let inner = self.inner.lock().await;
        Ok(facets(
            inner
                .rows
                .iter()
                .map(|row| &row.vehicle)
                .filter(|vehicle| {
                    vehicle.is_active
                        && vehicle
                            .listing
                            .brand
                            .as_deref()
                            .is_some_and(|b| b.to_lowercase() == wanted)
                })
                .filter_map(|vehicle| vehicle.listing.model.clone()),
        ))
    }

    async fn stats(&self) -> Result<CatalogStats, StoreError> {
        let inner = self.inner.lock().await;
        let active: Vec<&VehicleListing> = inner
            .rows
            .iter()
            .filter(|row| row.vehicle.is_active)
            .map(|row| &row.vehicle.listing)
            .collect();
        let brands: std::collections::HashSet<&str> =
            active.iter().filter_map(|l| l.brand.as_deref()).collect();
        let sources: std::collections::HashSet<_> = active.iter().map(|l| l.source).collect();
        let prices: Vec<f64> = active.iter().filter_map(|l| l.price_usd).collect();
        let avg = (!prices.is_empty()).then(|| prices.iter().sum::<f64>() / prices.len() as f64);
        Ok(CatalogStats {
            total_vehicles: active.len() as i64,
            total_brands: brands.len() as i64,
            total_sources: sources.len() as i64,
            avg_price_usd: avg,
            min_price_usd: prices.iter().copied().reduce(f64::min),
            max_price_usd: prices.iter().copied().reduce(f64::max),
        })
    }

    async fn deactivate_stale(
        &self,
        source: Source,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut deactivated = 0;
        for row in inner.rows.iter_mut().filter(|row| {
            row.vehicle.is_active
                && row.vehicle.listing.source == source
                && row.vehicle.updated_at < cutoff
        }) {
            row.vehicle.is_active = false;
            deactivated += 1;
        }
        Ok(deactivated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn listing(id: Option<&str>, brand: &str, model: &str, price: f64) -> VehicleListing {
        let mut listing = VehicleListing::new(Source::TuCarro);
        listing.external_id = id.map(str::to_string);
        listing.brand = Some(brand.into());
        listing.model = Some(model.into());
        listing.price_usd = Some(price);
        listing
    }

    #[tokio::test(flavor = "current_thread")]
    async fn upsert_refreshes_mutable_fields_only() {
        let store = MemoryStore::new();
        let first = store
            .upsert(&listing(Some("TCV1"), "Toyota", "Hilux", 30_000.0), Some(&[1.0, 0.0]))
            .await
            .unwrap();
        let mut changed = listing(Some("TCV1"), "Ford", "Ranger", 28_500.0);
        changed.mileage = Some(90_000);
        let second = store.upsert(&changed, Some(&[0.0, 1.0])).await.unwrap();

        assert_eq!(first, UpsertOutcome::Inserted(1));
        assert_eq!(second, UpsertOutcome::Updated(1));
        let stored = store.get(1).await.unwrap().expect("row");
        assert_eq!(stored.listing.brand.as_deref(), Some("Toyota"));
        assert_eq!(stored.listing.price_usd, Some(28_500.0));
        assert_eq!(stored.listing.mileage, Some(90_000));
        assert_eq!(store.embedding_of(1).await, Some(vec![0.0, 1.0]));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn listings_without_external_id_always_insert() {
        let store = MemoryStore::new();
        let car = listing(None, "Kia", "Rio", 7_000.0);
        store.upsert(&car, None).await.unwrap();
        store.upsert(&car, None).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert_eq!(store.missing_embeddings(10).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn semantic_ranking_is_ascending_distance() {
        let store = MemoryStore::new();
        store
            .upsert(&listing(Some("a"), "Toyota", "Corolla", 10_000.0), Some(&[0.0, 1.0]))
            .await
            .unwrap();
        store
            .upsert(&listing(Some("b"), "Toyota", "Hilux", 30_000.0), Some(&[1.0, 0.1]))
            .await
            .unwrap();
        let hits = store
            .search_semantic(&[1.0, 0.0], &SearchFilters::default(), 5)
            .await
            .unwrap();
        let models: Vec<_> = hits
            .iter()
            .map(|hit| hit.vehicle.listing.model.clone().unwrap())
            .collect();
        assert_eq!(models, vec!["Hilux".to_string(), "Corolla".to_string()]);
        assert!(hits[0].similarity_score.unwrap() > hits[1].similarity_score.unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stale_rows_are_soft_deleted() {
        let store = MemoryStore::new();
        store
            .upsert(&listing(Some("old"), "Fiat", "Uno", 3_000.0), None)
            .await
            .unwrap();
        store
            .upsert(&listing(Some("new"), "Fiat", "Palio", 4_000.0), None)
            .await
            .unwrap();
        let mut other = listing(Some("old"), "Fiat", "Uno", 3_000.0);
        other.source = Source::Autocosmos;
        store.upsert(&other, None).await.unwrap();
        let cutoff = Utc::now() - Duration::hours(24);
        for id in [1, 3] {
            store.touch(id, Utc::now() - Duration::hours(72)).await.unwrap();
        }

        let removed = store.deactivate_stale(Source::TuCarro, cutoff).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(3).await.unwrap().is_some());
        let removed = store.deactivate_stale(Source::Autocosmos, cutoff).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get(1).await.unwrap(), None);
        assert_eq!(store.stats().await.unwrap().total_vehicles, 1);
        assert_eq!(
            store.models("fiat").await.unwrap(),
            vec![Facet {
                value: "Palio".into(),
                count: 1
            }]
        );
    }

    #[test]
    fn zero_vectors_are_maximally_distant() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 1.0);
        assert!(cosine_distance(&[1.0], &[1.0, 0.0]).is_err());
    }
}
