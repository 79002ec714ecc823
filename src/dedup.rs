//! Collapses the union of every source's listings into one canonical set.

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use crate::vehicle::VehicleListing;

/// Identity used to decide whether two listings describe the same vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// Source-scoped identifier, when the listing carries one.
    ExternalId(String),
    /// Coarse attribute tuple for listings without an identifier.
    Attributes {
        /// Lowercased brand.
        brand: Option<String>,
        /// Lowercased model.
        model: Option<String>,
        /// Model year.
        year: Option<i32>,
        /// Bit pattern of the USD price, so the key stays `Eq + Hash`.
        price_usd_bits: Option<u64>,
    },
}

impl DedupKey {
    /// Key for `listing`.
    pub fn of(listing: &VehicleListing) -> Self {
        match listing.external_id() {
            Some(id) => DedupKey::ExternalId(id.to_string()),
            None => DedupKey::Attributes {
                brand: listing.brand.as_deref().map(str::to_lowercase),
                model: listing.model.as_deref().map(str::to_lowercase),
                year: listing.year,
                price_usd_bits: listing.price_usd.map(f64::to_bits),
            },
        }
    }
}

/// Counts reported by one dedup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    /// Listings received.
    pub input: usize,
    /// Listings kept.
    pub output: usize,
    /// Listings discarded as duplicates.
    pub removed: usize,
}

/// Keeps the first listing observed for every key, preserving input order.
pub fn dedupe(listings: Vec<VehicleListing>) -> (Vec<VehicleListing>, DedupReport) {
    let input = listings.len();
    let mut seen = HashSet::with_capacity(input);
    let unique: Vec<VehicleListing> = listings
        .into_iter()
        .filter(|listing| {
            let fresh = seen.insert(DedupKey::of(listing));
            if !fresh {
                debug!(source = %listing.source, external_id = ?listing.external_id, "duplicate listing");
            }
            fresh
        })
        .collect();
    let report = DedupReport {
        input,
        output: unique.len(),
        removed: input - unique.len(),
    };
    (unique, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::Source;
    use pretty_assertions::assert_eq;

    fn listing(source: Source, id: Option<&str>, brand: &str, model: &str, price: f64) -> VehicleListing {
        let mut listing = VehicleListing::new(source);
        listing.external_id = id.map(str::to_string);
        listing.brand = Some(brand.to_string());
        listing.model = Some(model.to_string());
        listing.year = Some(2018);
        listing.price_usd = Some(price);
        listing
    }

    #[test]
    fn shared_external_id_collapses_first_wins() {
        let first = listing(Source::TuCarro, Some("MLV-1"), "Toyota", "Hilux", 30_000.0);
        let second = listing(Source::MercadoLibre, Some("MLV-1"), "Toyota", "Hilux", 29_000.0);
        let (kept, report) = dedupe(vec![first.clone(), second]);
        assert_eq!(kept, vec![first]);
        assert_eq!(report, DedupReport { input: 2, output: 1, removed: 1 });
    }

    #[test]
    fn attribute_key_is_case_insensitive() {
        let a = listing(Source::Autocosmos, None, "Toyota", "Corolla", 12_000.0);
        let b = listing(Source::Multimarca, None, "TOYOTA", "corolla", 12_000.0);
        let c = listing(Source::Multimarca, None, "Toyota", "Corolla", 12_500.0);
        let (kept, report) = dedupe(vec![a, b, c]);
        assert_eq!(kept.len(), 2);
        assert_eq!(report.removed, 1);
    }

    #[test]
    fn attribute_key_separates_years() {
        let a = listing(Source::Autocosmos, None, "Toyota", "Corolla", 12_000.0);
        let mut b = listing(Source::Multimarca, None, "Toyota", "Corolla", 12_000.0);
        b.year = Some(2019);
        assert_ne!(DedupKey::of(&a), DedupKey::of(&b));
        let (kept, report) = dedupe(vec![a, b]);
        assert_eq!(kept.len(), 2);
        assert_eq!(report.removed, 0);
    }

    #[test]
    fn attribute_key_separates_models() {
        let a = listing(Source::Autocosmos, None, "Toyota", "Corolla", 12_000.0);
        let b = listing(Source::Multimarca, None, "Toyota", "Yaris", 12_000.0);
        assert_ne!(DedupKey::of(&a), DedupKey::of(&b));
        let (kept, report) = dedupe(vec![a, b]);
        assert_eq!(kept.len(), 2);
        assert_eq!(report.removed, 0);
    }

    #[test]
    fn blank_id_falls_back_to_attributes() {
        let a = listing(Source::Buscomiauto, Some(" "), "Ford", "Fiesta", 6_000.0);
        let b = listing(Source::Buscomiauto, None, "Ford", "Fiesta", 6_000.0);
        assert_eq!(DedupKey::of(&a), DedupKey::of(&b));
    }

    #[test]
    fn id_and_attribute_keys_never_collide() {
        let a = listing(Source::TuCarro, Some("TCV1"), "Ford", "Fiesta", 6_000.0);
        let b = listing(Source::TuCarro, None, "Ford", "Fiesta", 6_000.0);
        let (kept, _) = dedupe(vec![a, b]);
        assert_eq!(kept.len(), 2);
    }
}
