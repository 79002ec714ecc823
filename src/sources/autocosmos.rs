//! Autocosmos Venezuela listing adapter.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use super::markup::{parse_cards, CardLayout};
use super::{PageCursor, RawListing, SourceAdapter};
use crate::error::FetchError;
use crate::vehicle::Source;

const BASE_URL: &str = "https://www.autocosmos.com.ve";
const SEARCH_PATH: &str = "/auto/usado";

const LAYOUT: CardLayout = CardLayout {
    root: ".listing-container, .results, main",
    card: ".listing-card, .car-item, article",
    title: ".car-title, h3 a, .title, h3",
    price: ".price, .car-price, .precio",
    currency: None,
    link: "a",
    image: "img",
    location: Some(".location, .ubicacion"),
    details: Some(".details li, .car-details span, .specs span"),
};

static ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(\d+)/?(?:[?#].*)?$").expect("autocosmos id pattern compiles")
});

/// Scrapes the used-car listings of Autocosmos.
#[derive(Debug, Clone)]
pub struct AutocosmosAdapter {
    base: Url,
}

impl AutocosmosAdapter {
    /// Points the adapter at a different host (mirrors, test servers).
    pub fn with_base_url(base: Url) -> Self {
        Self { base }
    }
}

impl Default for AutocosmosAdapter {
    fn default() -> Self {
        Self::with_base_url(Url::parse(BASE_URL).expect("static autocosmos url"))
    }
}

impl SourceAdapter for AutocosmosAdapter {
    fn source(&self) -> Source {
        Source::Autocosmos
    }

    fn page_url(&self, cursor: PageCursor) -> String {
        let root = format!("{}{}", self.base.as_str().trim_end_matches('/'), SEARCH_PATH);
        match cursor.page() {
            1 => root,
            page => format!("{root}?p={page}"),
        }
    }

    fn parse_page(&self, page_url: &str, html: &str) -> Result<Vec<RawListing>, FetchError> {
        parse_cards(&LAYOUT, &self.base, page_url, html)
    }

    fn external_id(&self, listing_url: &str) -> Option<String> {
        ID_RE
            .captures(listing_url)
            .map(|caps| format!("AC-{}", &caps[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed() {
        let adapter = AutocosmosAdapter::default();
        assert_eq!(
            adapter
                .external_id("https://www.autocosmos.com.ve/auto/usado/jeep/cherokee/4411/")
                .as_deref(),
            Some("AC-4411")
        );
        assert_eq!(adapter.page_url(PageCursor::at(2)), "https://www.autocosmos.com.ve/auto/usado?p=2");
    }
}
