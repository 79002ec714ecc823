//! TuCarro (tucarro.com.ve) listing adapter.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use super::markup::{parse_cards, CardLayout};
use super::{PageCursor, RawListing, SourceAdapter};
use crate::error::FetchError;
use crate::vehicle::Source;

const BASE_URL: &str = "https://www.tucarro.com.ve";
const SEARCH_PATH: &str = "/carros/usados";

const LAYOUT: CardLayout = CardLayout {
    root: "ol.ui-search-layout, section.ui-search-results",
    card: "li.ui-search-layout__item, div.ui-search-result",
    title: ".ui-search-item__title, .poly-component__title",
    price: ".ui-search-price__second-line .andes-money-amount__fraction, .andes-money-amount__fraction",
    currency: Some(".andes-money-amount__currency-symbol"),
    link: "a.ui-search-link, a.poly-component__title, a",
    image: "img.ui-search-result-image__element, img",
    location: Some(".ui-search-item__location, .poly-component__location"),
    details: Some(".ui-search-card-attributes__attribute, .poly-attributes-list__item"),
};

// Listing codes look like `ABC12345` right after a `/` or `-`.
static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[/-]([A-Z]{3}\d+)").expect("tucarro id pattern compiles"));

/// Scrapes the used-car search results of TuCarro.
#[derive(Debug, Clone)]
pub struct TuCarroAdapter {
    base: Url,
}

impl TuCarroAdapter {
    /// Points the adapter at a different host (mirrors, test servers).
    pub fn with_base_url(base: Url) -> Self {
        Self { base }
    }
}

impl Default for TuCarroAdapter {
    fn default() -> Self {
        Self::with_base_url(Url::parse(BASE_URL).expect("static tucarro url"))
    }
}

impl SourceAdapter for TuCarroAdapter {
    fn source(&self) -> Source {
        Source::TuCarro
    }

    fn page_url(&self, cursor: PageCursor) -> String {
        format!(
            "{}{}?page={}",
            self.base.as_str().trim_end_matches('/'),
            SEARCH_PATH,
            cursor.page()
        )
    }

    fn parse_page(&self, page_url: &str, html: &str) -> Result<Vec<RawListing>, FetchError> {
        parse_cards(&LAYOUT, &self.base, page_url, html)
    }

    fn external_id(&self, listing_url: &str) -> Option<String> {
        ID_RE
            .captures(listing_url)
            .map(|caps| caps[1].to_string())
    }
}
