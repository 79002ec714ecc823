//! Persistence seam for the vehicle catalog.
//!
//! [`PgVehicleStore`] is the production implementation (Postgres + pgvector);
//! [`MemoryStore`] keeps the same semantics in process for tests and dry runs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Args;

use crate::error::StoreError;
use crate::filters::SearchFilters;
use crate::vehicle::{
    CatalogStats, Facet, RankedVehicle, Source, StoredVehicle, VehicleListing,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{quote_ident, PgVehicleStore, TableName};

/// Whether an upsert created a row or refreshed an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was created with this id.
    Inserted(i64),
    /// The row with this id was updated in place.
    Updated(i64),
}

impl UpsertOutcome {
    /// Store id of the affected row.
    pub fn id(&self) -> i64 {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => *id,
        }
    }
}

/// Catalog operations required by ingestion, search and the HTTP surface.
#[async_trait]
pub trait VehicleStore: Send + Sync {
    /// Inserts `listing`, or refreshes its mutable fields when `(source, external_id)` exists.
    /// Listings without an external id are always inserted. The row is (re)activated.
    async fn upsert(
        &self,
        listing: &VehicleListing,
        embedding: Option<&[f32]>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Active rows matching `filters`, nearest to `embedding` first.
    async fn search_semantic(
        &self,
        embedding: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<RankedVehicle>, StoreError>;

    /// Active rows matching `filters`, most recently updated first, without scores.
    async fn search_recent(
        &self,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<RankedVehicle>, StoreError>;

    /// Active rows whose embedding is missing or empty, oldest id first.
    async fn missing_embeddings(&self, limit: usize) -> Result<Vec<StoredVehicle>, StoreError>;

    /// Stores a fresh embedding for row `id`.
    async fn set_embedding(&self, id: i64, embedding: &[f32]) -> Result<(), StoreError>;

    /// Active row by id.
    async fn get(&self, id: i64) -> Result<Option<StoredVehicle>, StoreError>;

    /// Active listing count per brand, most common first.
    async fn brands(&self) -> Result<Vec<Facet>, StoreError>;

    /// Active listing count per model of `brand` (case-insensitive), most common first.
    async fn models(&self, brand: &str) -> Result<Vec<Facet>, StoreError>;

    /// Aggregates over active rows.
    async fn stats(&self) -> Result<CatalogStats, StoreError>;

    /// Marks active rows of `source` last refreshed before `cutoff` as inactive; returns how
    /// many.
    async fn deactivate_stale(
        &self,
        source: Source,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Postgres connection settings shared by both binaries.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Schema holding the vehicles table
    #[arg(long, env = "CARCRAWL_SCHEMA", default_value = "public")]
    pub schema: String,

    /// Vehicles table name
    #[arg(long, env = "CARCRAWL_TABLE", default_value = "vehicles")]
    pub table: String,

    /// Seconds before a single store query is abandoned
    #[arg(long, env = "CARCRAWL_STORE_TIMEOUT_SECS", default_value_t = 15)]
    pub store_timeout_secs: u64,
}

impl StoreArgs {
    /// Connects to Postgres and, when `prepare_dims` is set, bootstraps the schema.
    pub async fn connect(&self, prepare_dims: Option<usize>) -> anyhow::Result<PgVehicleStore> {
        let database_url = self
            .database_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--database-url (or DATABASE_URL) is required"))?;
        let table = TableName::new(self.schema.clone(), self.table.clone())?;
        let store = PgVehicleStore::connect(
            database_url,
            table,
            Duration::from_secs(self.store_timeout_secs.max(1)),
        )
        .await?;
        if let Some(dims) = prepare_dims {
            store.prepare(dims).await?;
        }
        Ok(store)
    }
}
