//! Structured search constraints and their precedence rules.

use serde::{Deserialize, Serialize};

use crate::extract::{MAX_YEAR, MIN_YEAR};
use crate::vehicle::VehicleListing;

/// Optional per-key constraints applied to a catalog query. Absent keys are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    /// Brand, matched case-insensitively.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    /// Model fragment, matched as a case-insensitive substring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Oldest acceptable model year.
    #[serde(alias = "yearMin", skip_serializing_if = "Option::is_none")]
    pub year_min: Option<i32>,
    /// Newest acceptable model year.
    #[serde(alias = "yearMax", skip_serializing_if = "Option::is_none")]
    pub year_max: Option<i32>,
    /// Upper bound on the USD price.
    #[serde(alias = "priceMaxUsd", skip_serializing_if = "Option::is_none")]
    pub price_max_usd: Option<f64>,
    /// Transmission, matched case-insensitively.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transmission: Option<String>,
    /// Fuel type, matched case-insensitively.
    #[serde(alias = "fuelType", skip_serializing_if = "Option::is_none")]
    pub fuel_type: Option<String>,
    /// Color fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Location fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Body type. Echoed back to callers; the catalog has no column to match it against.
    #[serde(alias = "vehicleType", skip_serializing_if = "Option::is_none")]
    pub vehicle_type: Option<String>,
}

impl SearchFilters {
    /// True when no key is set.
    pub fn is_empty(&self) -> bool {
        *self == SearchFilters::default()
    }

    /// Drops blank strings, non-positive prices and implausible years.
    pub fn sanitized(self) -> Self {
        let text = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let year = |value: Option<i32>| value.filter(|y| (MIN_YEAR..=MAX_YEAR).contains(y));
        Self {
            brand: text(self.brand),
            model: text(self.model),
            year_min: year(self.year_min),
            year_max: year(self.year_max),
            price_max_usd: self
                .price_max_usd
                .filter(|price| price.is_finite() && *price > 0.0),
            transmission: text(self.transmission),
            fuel_type: text(self.fuel_type),
            color: text(self.color),
            location: text(self.location),
            vehicle_type: text(self.vehicle_type),
        }
    }

    /// Per-key merge where every key set on `self` wins over `inferred`.
    pub fn merged_over(self, inferred: SearchFilters) -> SearchFilters {
        SearchFilters {
            brand: self.brand.or(inferred.brand),
            model: self.model.or(inferred.model),
            year_min: self.year_min.or(inferred.year_min),
            year_max: self.year_max.or(inferred.year_max),
            price_max_usd: self.price_max_usd.or(inferred.price_max_usd),
            transmission: self.transmission.or(inferred.transmission),
            fuel_type: self.fuel_type.or(inferred.fuel_type),
            color: self.color.or(inferred.color),
            location: self.location.or(inferred.location),
            vehicle_type: self.vehicle_type.or(inferred.vehicle_type),
        }
    }

    /// In-process evaluation of the store predicates. A constrained key never matches a
    /// missing attribute, the same way a SQL comparison against NULL does not.
    pub fn matches(&self, listing: &VehicleListing) -> bool {
        equals(&self.brand, &listing.brand)
            && contains(&self.model, &listing.model)
            && self
                .year_min
                .is_none_or(|min| listing.year.is_some_and(|year| year >= min))
            && self
                .year_max
                .is_none_or(|max| listing.year.is_some_and(|year| year <= max))
            && self
                .price_max_usd
                .is_none_or(|max| listing.price_usd.is_some_and(|price| price <= max))
            && equals(&self.transmission, &listing.transmission)
            && equals(&self.fuel_type, &listing.fuel_type)
            && contains(&self.color, &listing.color)
            && contains(&self.location, &listing.location)
    }
}

fn equals(wanted: &Option<String>, actual: &Option<String>) -> bool {
    match (wanted, actual) {
        (None, _) => true,
        (Some(wanted), Some(actual)) => wanted.to_lowercase() == actual.to_lowercase(),
        (Some(_), None) => false,
    }
}

fn contains(wanted: &Option<String>, actual: &Option<String>) -> bool {
    match (wanted, actual) {
        (None, _) => true,
        (Some(wanted), Some(actual)) => actual.to_lowercase().contains(&wanted.to_lowercase()),
        (Some(_), None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::Source;
    use pretty_assertions::assert_eq;

    #[test]
    fn explicit_keys_win_inferred_fill_gaps() {
        let explicit = SearchFilters {
            brand: Some("Toyota".into()),
            ..SearchFilters::default()
        };
        let inferred = SearchFilters {
            brand: Some("Ford".into()),
            year_min: Some(2018),
            ..SearchFilters::default()
        };
        assert_eq!(
            explicit.merged_over(inferred),
            SearchFilters {
                brand: Some("Toyota".into()),
                year_min: Some(2018),
                ..SearchFilters::default()
            }
        );
    }

    #[test]
    fn accepts_camel_case_aliases() {
        let filters: SearchFilters =
            serde_json::from_str(r#"{"yearMin": 2015, "priceMaxUsd": 20000, "fuelType": "Diesel"}"#)
                .expect("filters decode");
        assert_eq!(filters.year_min, Some(2015));
        assert_eq!(filters.price_max_usd, Some(20_000.0));
        assert_eq!(filters.fuel_type.as_deref(), Some("Diesel"));
    }

    #[test]
    fn serializes_only_present_keys() {
        let filters = SearchFilters {
            brand: Some("Kia".into()),
            ..SearchFilters::default()
        };
        assert_eq!(serde_json::to_string(&filters).unwrap(), r#"{"brand":"Kia"}"#);
        assert!(SearchFilters::default().is_empty());
    }

    #[test]
    fn sanitize_drops_blank_and_implausible_values() {
        let filters = SearchFilters {
            brand: Some("  ".into()),
            year_min: Some(1800),
            year_max: Some(2020),
            price_max_usd: Some(0.0),
            ..SearchFilters::default()
        }
        .sanitized();
        assert_eq!(
            filters,
            SearchFilters {
                year_max: Some(2020),
                ..SearchFilters::default()
            }
        );
    }

    #[test]
    fn matching_follows_store_predicates() {
        let mut listing = VehicleListing::new(Source::TuCarro);
        listing.brand = Some("Toyota".into());
        listing.model = Some("4Runner Limited".into());
        listing.year = Some(2019);
        listing.price_usd = Some(38_000.0);
        listing.location = Some("Caracas, Distrito Capital".into());

        let hit = SearchFilters {
            brand: Some("TOYOTA".into()),
            model: Some("4runner".into()),
            year_min: Some(2018),
            price_max_usd: Some(40_000.0),
            location: Some("caracas".into()),
            vehicle_type: Some("SUV".into()),
            ..SearchFilters::default()
        };
        assert!(hit.matches(&listing));

        let miss = SearchFilters {
            transmission: Some("Manual".into()),
            ..SearchFilters::default()
        };
        assert!(!miss.matches(&listing));
    }
}
