//! Canonical vehicle record shapes shared by every pipeline stage.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Marketplaces the catalog aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// tucarro.com.ve
    TuCarro,
    /// mercadolibre.com.ve
    MercadoLibre,
    /// autocosmos.com.ve
    Autocosmos,
    /// buscomiauto.com
    Buscomiauto,
    /// multimarca.com.ve
    Multimarca,
}

impl Source {
    /// Every known source, in default scheduling order.
    pub const ALL: [Source; 5] = [
        Source::TuCarro,
        Source::MercadoLibre,
        Source::Autocosmos,
        Source::Buscomiauto,
        Source::Multimarca,
    ];

    /// Stable identifier stored in the `source` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::TuCarro => "tucarro",
            Source::MercadoLibre => "mercadolibre",
            Source::Autocosmos => "autocosmos",
            Source::Buscomiauto => "buscomiauto",
            Source::Multimarca => "multimarca",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let needle = value.trim().to_ascii_lowercase();
        Source::ALL
            .into_iter()
            .find(|source| source.as_str() == needle)
            .ok_or_else(|| format!("unknown source '{value}'"))
    }
}

/// Opaque seller contact metadata.
pub type ContactInfo = BTreeMap<String, JsonValue>;

/// Normalized listing produced by a source adapter, before it reaches the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleListing {
    /// Marketplace the listing came from.
    pub source: Source,
    /// Source-scoped listing identifier.
    pub external_id: Option<String>,
    /// Manufacturer.
    pub brand: Option<String>,
    /// Model name.
    pub model: Option<String>,
    /// Model year.
    pub year: Option<i32>,
    /// Asking price in US dollars.
    pub price_usd: Option<f64>,
    /// Asking price in local currency (bolívares).
    pub price_local: Option<f64>,
    /// Odometer reading in kilometers.
    pub mileage: Option<i64>,
    /// Transmission kind.
    pub transmission: Option<String>,
    /// Fuel kind.
    pub fuel_type: Option<String>,
    /// Exterior color.
    pub color: Option<String>,
    /// City or state.
    pub location: Option<String>,
    /// Free-text description.
    pub description: Option<String>,
    /// Image URLs.
    #[serde(default)]
    pub images: Vec<String>,
    /// Seller contact metadata.
    #[serde(default)]
    pub contact: ContactInfo,
    /// Listing URL on the source site.
    pub url: Option<String>,
}

impl VehicleListing {
    /// Creates an empty listing for `source`.
    pub fn new(source: Source) -> Self {
        Self {
            source,
            external_id: None,
            brand: None,
            model: None,
            year: None,
            price_usd: None,
            price_local: None,
            mileage: None,
            transmission: None,
            fuel_type: None,
            color: None,
            location: None,
            description: None,
            images: Vec::new(),
            contact: ContactInfo::new(),
            url: None,
        }
    }

    /// True when at least one asking price is known.
    pub fn has_price(&self) -> bool {
        self.price_usd.is_some() || self.price_local.is_some()
    }

    /// External id, ignoring blank strings.
    pub fn external_id(&self) -> Option<&str> {
        self.external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// A listing as persisted in the catalog. The embedding column is never loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVehicle {
    /// Store-assigned identifier.
    pub id: i64,
    /// Descriptive attributes.
    #[serde(flatten)]
    pub listing: VehicleListing,
    /// False once the listing has been soft-deleted.
    pub is_active: bool,
    /// First time the listing was stored.
    pub scraped_at: DateTime<Utc>,
    /// Last time a scrape refreshed the listing.
    pub updated_at: DateTime<Utc>,
}

/// Search hit: a stored vehicle plus its similarity when semantic ranking ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedVehicle {
    /// Matched vehicle.
    #[serde(flatten)]
    pub vehicle: StoredVehicle,
    /// `1 - cosine distance`, clamped to `[0, 1]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f64>,
}

impl RankedVehicle {
    /// Builds a hit from a raw cosine distance.
    pub fn from_distance(vehicle: StoredVehicle, distance: f64) -> Self {
        Self {
            vehicle,
            similarity_score: Some((1.0 - distance).clamp(0.0, 1.0)),
        }
    }

    /// Builds an unranked hit (filter-only path).
    pub fn unranked(vehicle: StoredVehicle) -> Self {
        Self {
            vehicle,
            similarity_score: None,
        }
    }
}

/// Brand or model facet with its listing count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facet {
    /// Facet value.
    pub value: String,
    /// Active listings carrying the value.
    pub count: i64,
}

/// Aggregate catalog statistics over active listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogStats {
    /// Active listing count.
    pub total_vehicles: i64,
    /// Distinct brands.
    pub total_brands: i64,
    /// Distinct sources.
    pub total_sources: i64,
    /// Mean USD price.
    pub avg_price_usd: Option<f64>,
    /// Cheapest USD price.
    pub min_price_usd: Option<f64>,
    /// Most expensive USD price.
    pub max_price_usd: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips_through_str() {
        for source in Source::ALL {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
        assert_eq!(" TuCarro ".parse::<Source>().unwrap(), Source::TuCarro);
        assert!("craigslist".parse::<Source>().is_err());
    }

    #[test]
    fn similarity_is_clamped() {
        let vehicle = StoredVehicle {
            id: 1,
            listing: VehicleListing::new(Source::TuCarro),
            is_active: true,
            scraped_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let hit = RankedVehicle::from_distance(vehicle.clone(), 1.4);
        assert_eq!(hit.similarity_score, Some(0.0));
        let hit = RankedVehicle::from_distance(vehicle, 0.25);
        assert_eq!(hit.similarity_score, Some(0.75));
    }

    #[test]
    fn blank_external_id_is_ignored() {
        let mut listing = VehicleListing::new(Source::Multimarca);
        listing.external_id = Some("  ".into());
        assert_eq!(listing.external_id(), None);
        listing.external_id = Some("MM-12".into());
        assert_eq!(listing.external_id(), Some("MM-12"));
    }
}
