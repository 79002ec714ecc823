//! Buscomiauto listing adapter.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use super::markup::{parse_cards, CardLayout};
use super::{PageCursor, RawListing, SourceAdapter};
use crate::error::FetchError;
use crate::vehicle::Source;

const BASE_URL: &str = "https://buscomiauto.com";
const SEARCH_PATH: &str = "/vehicles";

const LAYOUT: CardLayout = CardLayout {
    root: ".vehicles-grid, .vehicle-list, main",
    card: ".vehicle-card, .vehicle-item, article",
    title: "h3, .vehicle-title, .car-title",
    price: ".price, .vehicle-price",
    currency: None,
    link: "a",
    image: "img",
    location: Some(".vehicle-location, .location"),
    details: Some(".spec, .detail, .feature"),
};

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/vehicles/(\d+)").expect("buscomiauto id pattern compiles"));

/// Scrapes the inventory pages of Buscomiauto.
#[derive(Debug, Clone)]
pub struct BuscomiautoAdapter {
    base: Url,
}

impl BuscomiautoAdapter {
    /// Points the adapter at a different host (mirrors, test servers).
    pub fn with_base_url(base: Url) -> Self {
        Self { base }
    }
}

impl Default for BuscomiautoAdapter {
    fn default() -> Self {
        Self::with_base_url(Url::parse(BASE_URL).expect("static buscomiauto url"))
    }
}

impl SourceAdapter for BuscomiautoAdapter {
    fn source(&self) -> Source {
        Source::Buscomiauto
    }

    fn page_url(&self, cursor: PageCursor) -> String {
        let root = format!("{}{}", self.base.as_str().trim_end_matches('/'), SEARCH_PATH);
        match cursor.page() {
            1 => root,
            page => format!("{root}?page={page}"),
        }
    }

    fn parse_page(&self, page_url: &str, html: &str) -> Result<Vec<RawListing>, FetchError> {
        parse_cards(&LAYOUT, &self.base, page_url, html)
    }

    fn external_id(&self, listing_url: &str) -> Option<String> {
        ID_RE
            .captures(listing_url)
            .map(|caps| format!("BCM-{}", &caps[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_specs_from_card() {
        let html = r#"
            <main>
              <article class="vehicle-card">
                <a href="/vehicles/5120"><h3>Nissan Frontier 2016</h3></a>
                <div class="price">$ 19.900</div>
                <span class="spec">Diesel</span><span class="spec">Manual</span>
                <span class="spec">110.000 km</span>
              </article>
            </main>
        "#;
        let adapter = BuscomiautoAdapter::default();
        let raws = adapter
            .parse_page("https://buscomiauto.com/vehicles", html)
            .expect("parse page");
        let listing = adapter.normalize(raws[0].clone()).expect("priced listing");
        assert_eq!(listing.external_id.as_deref(), Some("BCM-5120"));
        assert_eq!(listing.url.as_deref(), Some("https://buscomiauto.com/vehicles/5120"));
        assert_eq!(listing.fuel_type.as_deref(), Some("Diesel"));
        assert_eq!(listing.transmission.as_deref(), Some("Manual"));
        assert_eq!(listing.mileage, Some(110_000));
        assert_eq!(listing.price_usd, Some(19_900.0));
    }
}
