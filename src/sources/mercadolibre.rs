//! MercadoLibre Venezuela listing adapter.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use super::markup::{parse_cards, CardLayout};
use super::{PageCursor, RawListing, SourceAdapter};
use crate::error::FetchError;
use crate::extract::Currency;
use crate::vehicle::Source;

const BASE_URL: &str = "https://www.mercadolibre.com.ve";
const SEARCH_PATH: &str = "/vehiculos/carros-camionetas";
const PAGE_SIZE: u32 = 50;

const LAYOUT: CardLayout = CardLayout {
    root: "ol.ui-search-layout, section.ui-search-results",
    card: ".ui-search-result__wrapper, li.ui-search-layout__item",
    title: ".ui-search-item__title, .poly-component__title",
    price: ".andes-money-amount__fraction",
    currency: Some(".andes-money-amount__currency-symbol"),
    link: "a.ui-search-link, a.poly-component__title, a",
    image: "img.ui-search-result-image__element, img",
    location: Some(".ui-search-item__location, .poly-component__location"),
    details: Some(".ui-search-item__subtitle, .poly-attributes-list__item"),
};

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(MLV-?\d+)").expect("mercadolibre id pattern compiles"));

/// Scrapes the cars & trucks category of MercadoLibre, which quotes either dollars or bolívares.
#[derive(Debug, Clone)]
pub struct MercadoLibreAdapter {
    base: Url,
}

impl MercadoLibreAdapter {
    /// Points the adapter at a different host (mirrors, test servers).
    pub fn with_base_url(base: Url) -> Self {
        Self { base }
    }
}

impl Default for MercadoLibreAdapter {
    fn default() -> Self {
        Self::with_base_url(Url::parse(BASE_URL).expect("static mercadolibre url"))
    }
}

impl SourceAdapter for MercadoLibreAdapter {
    fn source(&self) -> Source {
        Source::MercadoLibre
    }

    fn page_url(&self, cursor: PageCursor) -> String {
        let root = format!("{}{}", self.base.as_str().trim_end_matches('/'), SEARCH_PATH);
        match cursor.offset(PAGE_SIZE) {
            0 => root,
            offset => format!("{root}_Desde_{offset}"),
        }
    }

    fn parse_page(&self, page_url: &str, html: &str) -> Result<Vec<RawListing>, FetchError> {
        parse_cards(&LAYOUT, &self.base, page_url, html)
    }

    fn external_id(&self, listing_url: &str) -> Option<String> {
        ID_RE
            .captures(listing_url)
            .map(|caps| caps[1].to_string())
    }

    // Cards without a dollar marker are priced in bolívares.
    fn default_currency(&self) -> Currency {
        Currency::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paginates_by_offset() {
        let adapter = MercadoLibreAdapter::default();
        assert_eq!(
            adapter.page_url(PageCursor::first()),
            "https://www.mercadolibre.com.ve/vehiculos/carros-camionetas"
        );
        assert_eq!(
            adapter.page_url(PageCursor::at(3)),
            "https://www.mercadolibre.com.ve/vehiculos/carros-camionetas_Desde_100"
        );
    }

    #[test]
    fn splits_dollar_and_bolivar_prices() {
        let html = r#"
            <section class="ui-search-results">
              <div class="ui-search-result__wrapper">
                <a class="ui-search-link" href="https://carro.mercadolibre.com.ve/MLV-700111-chevrolet-aveo">
                  <h2 class="ui-search-item__title">Chevrolet Aveo LT 2012</h2>
                </a>
                <span class="andes-money-amount__currency-symbol">US$</span>
                <span class="andes-money-amount__fraction">4.800</span>
                <span class="ui-search-item__subtitle">2012 | 150.000 Km</span>
              </div>
              <div class="ui-search-result__wrapper">
                <a class="ui-search-link" href="https://carro.mercadolibre.com.ve/MLV-700222-fiat-uno">
                  <h2 class="ui-search-item__title">Fiat Uno 2008</h2>
                </a>
                <span class="andes-money-amount__currency-symbol">Bs.</span>
                <span class="andes-money-amount__fraction">95.000</span>
              </div>
            </section>
        "#;
        let adapter = MercadoLibreAdapter::default();
        let listings: Vec<_> = adapter
            .parse_page("https://www.mercadolibre.com.ve/vehiculos/carros-camionetas", html)
            .expect("parse page")
            .into_iter()
            .filter_map(|raw| adapter.normalize(raw))
            .collect();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].external_id.as_deref(), Some("MLV-700111"));
        assert_eq!(listings[0].price_usd, Some(4_800.0));
        assert_eq!(listings[0].mileage, Some(150_000));
        assert_eq!(listings[1].price_usd, None);
        assert_eq!(listings[1].price_local, Some(95_000.0));
    }
}
