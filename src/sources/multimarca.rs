//! Multimarca dealer-network listing adapter.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use super::markup::{parse_cards, CardLayout};
use super::{PageCursor, RawListing, SourceAdapter};
use crate::error::FetchError;
use crate::vehicle::Source;

const BASE_URL: &str = "https://multimarca.com.ve";
const SEARCH_PATH: &str = "/vehiculos";

const LAYOUT: CardLayout = CardLayout {
    root: ".vehicles, .inventory, main",
    card: ".vehicle-item, .car-card, .product, article",
    title: "h3, .vehicle-name, .title",
    price: ".price, .precio",
    currency: None,
    link: "a",
    image: "img",
    location: None,
    details: Some(".vehicle-specs li, .specs span"),
};

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(\d+)").expect("multimarca id pattern compiles"));

/// Scrapes the stock pages of the Multimarca dealer network.
#[derive(Debug, Clone)]
pub struct MultimarcaAdapter {
    base: Url,
}

impl MultimarcaAdapter {
    /// Points the adapter at a different host (mirrors, test servers).
    pub fn with_base_url(base: Url) -> Self {
        Self { base }
    }
}

impl Default for MultimarcaAdapter {
    fn default() -> Self {
        Self::with_base_url(Url::parse(BASE_URL).expect("static multimarca url"))
    }
}

impl SourceAdapter for MultimarcaAdapter {
    fn source(&self) -> Source {
        Source::Multimarca
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
        let path = Url::parse(listing_url)
            .map(|url| url.path().to_string())
            .unwrap_or_else(|_| listing_url.to_string());
        ID_RE
            .captures(&path)
            .map(|caps| format!("MM-{}", &caps[1]))
    }
}
