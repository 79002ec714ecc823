use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use tokio_postgres::types::{Json, ToSql};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info};

use super::{UpsertOutcome, VehicleStore};
use crate::error::StoreError;
use crate::filters::SearchFilters;
use crate::vehicle::{
    CatalogStats, ContactInfo, Facet, RankedVehicle, Source, StoredVehicle, VehicleListing,
};

const VEHICLE_COLUMNS: &str = "id, source, external_id, brand, model, year, price_usd, \
    price_local, mileage, transmission, fuel_type, color, location, description, images, \
    contact, url, is_active, scraped_at, updated_at";

type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        anyhow::ensure!(!schema.trim().is_empty(), "schema name is required");
        anyhow::ensure!(!table.trim().is_empty(), "table name is required");
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Quoted index name derived from the table, e.g. `"public_vehicles_brand_idx"`.
    pub fn index_name(&self, suffix: &str) -> String {
        quote_ident(&format!(
            "{}_{}_{}_idx",
            sanitize_ident(&self.schema),
            sanitize_ident(&self.table),
            suffix
        ))
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// Catalog stored in a pgvector-enabled Postgres table.
#[derive(Clone)]
pub struct PgVehicleStore {
    db: Arc<Client>,
    table: TableName,
    timeout: Duration,
}

impl PgVehicleStore {
    /// Connects to `database_url` and drives the connection on a background task.
    pub async fn connect(database_url: &str, table: TableName, timeout: Duration) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to Postgres at {database_url}"))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection error");
            }
        });
        Ok(Self::from_client(Arc::new(client), table, timeout))
    }

    /// Wraps an already-connected client.
    pub fn from_client(db: Arc<Client>, table: TableName, timeout: Duration) -> Self {
        Self { db, table, timeout }
    }

    /// Creates the pgvector extension, the vehicles table and its indexes if missing.
    pub async fn prepare(&self, dims: usize) -> Result<()> {
        anyhow::ensure!(dims > 0, "embedding dimension must be positive");
        self.db
            .execute("CREATE EXTENSION IF NOT EXISTS vector", &[])
            .await
            .context("failed to ensure pgvector extension")?;

        let qualified = self.table.qualified();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {qualified} (
                id BIGSERIAL PRIMARY KEY,
                source TEXT NOT NULL,
                external_id TEXT,
                brand TEXT,
                model TEXT,
                year INTEGER,
                price_usd DOUBLE PRECISION,
                price_local DOUBLE PRECISION,
                mileage BIGINT,
                transmission TEXT,
                fuel_type TEXT,
                color TEXT,
                location TEXT,
                description TEXT,
                images JSONB NOT NULL DEFAULT '[]'::jsonb,
                contact JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                url TEXT,
                embedding VECTOR({dims}),
                is_active BOOLEAN NOT NULL DEFAULT true,
                scraped_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (source, external_id)
            )"
        );
        self.db
            .execute(&ddl, &[])
            .await
            .context("failed to create vehicles table")?;

        for column in [
            "brand",
            "model",
            "year",
            "price_usd",
            "location",
            "source",
            "is_active",
            "updated_at",
        ] {
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {} ON {qualified} ({column})",
                self.table.index_name(column)
            );
            self.db
                .execute(&sql, &[])
                .await
                .with_context(|| format!("failed to ensure {column} index"))?;
        }

        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {qualified} \
                USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)",
            self.table.index_name("embedding")
        );
        self.db
            .execute(&sql, &[])
            .await
            .context("failed to ensure ivfflat embedding index")?;
        info!(table = %qualified, dims, "vehicle table ready");
        Ok(())
    }

    async fn timed<T, F>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, tokio_postgres::Error>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout {
                operation,
                timeout: self.timeout,
            })?
            .map_err(StoreError::from)
    }

    async fn query(
        &self,
        operation: &'static str,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<Row>, StoreError> {
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|param| param.as_ref() as &(dyn ToSql + Sync))
            .collect();
        self.timed(operation, self.db.query(sql, &refs)).await
    }
}

fn upsert_sql(table: &TableName) -> String {
    format!(
        "INSERT INTO {} AS t \
            (source, external_id, brand, model, year, price_usd, price_local, mileage, \
             transmission, fuel_type, color, location, description, images, contact, url, \
             embedding, is_active, scraped_at, updated_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             true, now(), now()) \
            ON CONFLICT (source, external_id) DO UPDATE SET \
                price_usd = EXCLUDED.price_usd, \
                price_local = EXCLUDED.price_local, \
                mileage = EXCLUDED.mileage, \
                description = EXCLUDED.description, \
                images = EXCLUDED.images, \
                embedding = COALESCE(EXCLUDED.embedding, t.embedding), \
                is_active = true, \
                updated_at = now() \
            RETURNING id, (xmax = 0) AS inserted",
        table.qualified()
    )
}

fn escape_like(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len() + 2);
    escaped.push('%');
    for ch in fragment.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// Renders the per-key predicates of `filters` as ` AND ...` clauses whose placeholders start
/// at `$first_param`. `vehicle_type` has no column and produces no clause.
fn filter_clauses(filters: &SearchFilters, first_param: usize) -> (String, Vec<SqlParam>) {
    let mut sql = String::new();
    let mut params: Vec<SqlParam> = Vec::new();
    let mut push = |clause: &str, param: SqlParam| {
        let index = first_param + params.len();
        sql.push_str(" AND ");
        sql.push_str(&clause.replace("$?", &format!("${index}")));
        params.push(param);
    };

    if let Some(brand) = &filters.brand {
        push("LOWER(brand) = LOWER($?)", Box::new(brand.clone()));
    }
    if let Some(model) = &filters.model {
        push("LOWER(model) LIKE LOWER($?)", Box::new(escape_like(model)));
    }
    if let Some(year_min) = filters.year_min {
        push("year >= $?", Box::new(year_min));
    }
    if let Some(year_max) = filters.year_max {
        push("year <= $?", Box::new(year_max));
    }
    if let Some(price) = filters.price_max_usd {
        push("price_usd <= $?", Box::new(price));
    }
    if let Some(transmission) = &filters.transmission {
        push("LOWER(transmission) = LOWER($?)", Box::new(transmission.clone()));
    }
    if let Some(fuel_type) = &filters.fuel_type {
        push("LOWER(fuel_type) = LOWER($?)", Box::new(fuel_type.clone()));
    }
    if let Some(color) = &filters.color {
        push("LOWER(color) LIKE LOWER($?)", Box::new(escape_like(color)));
    }
    if let Some(location) = &filters.location {
        push("LOWER(location) LIKE LOWER($?)", Box::new(escape_like(location)));
    }
    (sql, params)
}

fn vehicle_from_row(row: &Row) -> Result<StoredVehicle, StoreError> {
    let source: String = row.try_get("source")?;
    let source = source.parse::<Source>().map_err(StoreError::Decode)?;
    let Json(images): Json<Vec<String>> = row.try_get("images")?;
    let Json(contact): Json<ContactInfo> = row.try_get("contact")?;
    let listing = VehicleListing {
        source,
        external_id: row.try_get("external_id")?,
        brand: row.try_get("brand")?,
        model: row.try_get("model")?,
        year: row.try_get("year")?,
        price_usd: row.try_get("price_usd")?,
        price_local: row.try_get("price_local")?,
        mileage: row.try_get("mileage")?,
        transmission: row.try_get("transmission")?,
        fuel_type: row.try_get("fuel_type")?,
        color: row.try_get("color")?,
        location: row.try_get("location")?,
        description: row.try_get("description")?,
        images,
        contact,
        url: row.try_get("url")?,
    };
    Ok(StoredVehicle {
        id: row.try_get("id")?,
        listing,
        is_active: row.try_get("is_active")?,
        scraped_at: row.try_get("scraped_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn facets_from_rows(rows: &[Row]) -> Result<Vec<Facet>, StoreError> {
    rows.iter()
        .map(|row| {
            Ok(Facet {
                value: row.try_get("value")?,
                count: row.try_get("count")?,
            })
        })
        .collect()
}

fn deactivate_sql(table: &TableName) -> String {
    format!(
        "UPDATE {} SET is_active = false \
         WHERE is_active = true AND source = $1 AND updated_at < $2",
        table.qualified()
    )
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl VehicleStore for PgVehicleStore {
    async fn upsert(
        &self,
        listing: &VehicleListing,
        embedding: Option<&[f32]>,
    ) -> Result<UpsertOutcome, StoreError> {
        let sql = upsert_sql(&self.table);
        let external_id = listing.external_id().map(str::to_string);
        let vector = embedding.map(|values| Vector::from(values.to_vec()));
        let images = Json(&listing.images);
        let contact = Json(&listing.contact);
        let row = self
            .timed(
                "upsert",
                self.db.query_one(
                    &sql,
                    &[
                        &listing.source.as_str(),
                        &external_id,
                        &listing.brand,
                        &listing.model,
                        &listing.year,
                        &listing.price_usd,
                        &listing.price_local,
                        &listing.mileage,
                        &listing.transmission,
                        &listing.fuel_type,
                        &listing.color,
                        &listing.location,
                        &listing.description,
                        &images,
                        &contact,
                        &listing.url,
                        &vector,
                    ],
                ),
            )
            .await?;
        let id: i64 = row.try_get("id")?;
        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted(id)
        } else {
            UpsertOutcome::Updated(id)
        })
    }

    async fn search_semantic(
        &self,
        embedding: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<RankedVehicle>, StoreError> {
        let (clauses, mut params) = filter_clauses(filters, 2);
        let limit_param = params.len() + 2;
        let sql = format!(
            "SELECT {VEHICLE_COLUMNS}, embedding <=> $1 AS distance \
            FROM {} \
            WHERE is_active = true AND embedding IS NOT NULL{clauses} \
            ORDER BY embedding <=> $1 ASC \
            LIMIT ${limit_param}",
            self.table.qualified()
        );
        params.insert(0, Box::new(Vector::from(embedding.to_vec())));
        params.push(Box::new(sql_limit(limit)));
        let rows = self.query("search_semantic", &sql, &params).await?;
        rows.iter()
            .map(|row| {
                let distance: f64 = row.try_get("distance")?;
                Ok(RankedVehicle::from_distance(vehicle_from_row(row)?, distance))
            })
            .collect()
    }

    async fn search_recent(
        &self,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<RankedVehicle>, StoreError> {
        let (clauses, mut params) = filter_clauses(filters, 1);
        let limit_param = params.len() + 1;
        let sql = format!(
            "SELECT {VEHICLE_COLUMNS} FROM {} \
            WHERE is_active = true{clauses} \
            ORDER BY updated_at DESC, id DESC \
            LIMIT ${limit_param}",
            self.table.qualified()
        );
        params.push(Box::new(sql_limit(limit)));
        let rows = self.query("search_recent", &sql, &params).await?;
        rows.iter()
            .map(|row| vehicle_from_row(row).map(RankedVehicle::unranked))
            .collect()
    }

    async fn missing_embeddings(&self, limit: usize) -> Result<Vec<StoredVehicle>, StoreError> {
        let sql = format!(
            "SELECT {VEHICLE_COLUMNS} FROM {} \
            WHERE is_active = true AND embedding IS NULL \
            ORDER BY id ASC LIMIT $1",
            self.table.qualified()
        );
        let rows = self
            .query("missing_embeddings", &sql, &[Box::new(sql_limit(limit)) as SqlParam])
            .await?;
        rows.iter().map(vehicle_from_row).collect()
    }

    async fn set_embedding(&self, id: i64, embedding: &[f32]) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET embedding = $1 WHERE id = $2",
            self.table.qualified()
        );
        let vector = Vector::from(embedding.to_vec());
        let updated = self
            .timed("set_embedding", self.db.execute(&sql, &[&vector, &id]))
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<StoredVehicle>, StoreError> {
        let sql = format!(
            "SELECT {VEHICLE_COLUMNS} FROM {} WHERE id = $1 AND is_active = true",
            self.table.qualified()
        );
        let row = self
            .timed("get", self.db.query_opt(&sql, &[&id]))
            .await?;
        row.as_ref().map(vehicle_from_row).transpose()
    }

    async fn brands(&self) -> Result<Vec<Facet>, StoreError> {
        let sql = format!(
            "SELECT brand AS value, COUNT(*) AS count FROM {} \
            WHERE is_active = true AND brand IS NOT NULL \
            GROUP BY brand ORDER BY count DESC, value ASC",
            self.table.qualified()
        );
        let rows = self.query("brands", &sql, &[]).await?;
        facets_from_rows(&rows)
    }

    async fn models(&self, brand: &str) -> Result<Vec<Facet>, StoreError> {
        let sql = format!(
            "SELECT model AS value, COUNT(*) AS count FROM {} \
            WHERE is_active = true AND model IS NOT NULL AND LOWER(brand) = LOWER($1) \
            GROUP BY model ORDER BY count DESC, value ASC",
            self.table.qualified()
        );
        let rows = self
            .query("models", &sql, &[Box::new(brand.to_string()) as SqlParam])
            .await?;
        facets_from_rows(&rows)
    }

    async fn stats(&self) -> Result<CatalogStats, StoreError> {
        let sql = format!(
            "SELECT \
                COUNT(*) AS total_vehicles, \
                COUNT(DISTINCT brand) AS total_brands, \
                COUNT(DISTINCT source) AS total_sources, \
                AVG(price_usd) AS avg_price_usd, \
                MIN(price_usd) AS min_price_usd, \
                MAX(price_usd) AS max_price_usd \
            FROM {} WHERE is_active = true",
            self.table.qualified()
        );
        let row = self.timed("stats", self.db.query_one(&sql, &[])).await?;
        Ok(CatalogStats {
            total_vehicles: row.try_get("total_vehicles")?,
            total_brands: row.try_get("total_brands")?,
            total_sources: row.try_get("total_sources")?,
            avg_price_usd: row.try_get("avg_price_usd")?,
            min_price_usd: row.try_get("min_price_usd")?,
            max_price_usd: row.try_get("max_price_usd")?,
        })
    }

    async fn deactivate_stale(
        &self,
        source: Source,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let sql = deactivate_sql(&self.table);
        self.timed(
            "deactivate_stale",
            self.db.execute(&sql, &[&source.as_str(), &cutoff]),
        )
        .await
    }
}
