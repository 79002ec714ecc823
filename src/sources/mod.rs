//! Marketplace adapters: one fixed contract, one implementation per source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::FetchError;
use crate::extract::{
    classify_currency, clean_text, detect_brand, detect_fuel_type, detect_transmission,
    extract_mileage, extract_model, extract_year, parse_price, Currency,
};
use crate::vehicle::{Source, VehicleListing};

mod autocosmos;
mod buscomiauto;
pub mod markup;
mod mercadolibre;
mod multimarca;
mod tucarro;

pub use autocosmos::AutocosmosAdapter;
pub use buscomiauto::BuscomiautoAdapter;
pub use markup::CardLayout;
pub use mercadolibre::MercadoLibreAdapter;
pub use multimarca::MultimarcaAdapter;
pub use tucarro::TuCarroAdapter;

/// One-based results page requested from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageCursor {
    page: u32,
}

impl PageCursor {
    /// Cursor for the first results page.
    pub fn first() -> Self {
        Self { page: 1 }
    }

    /// Cursor for an explicit one-based page number.
    pub fn at(page: u32) -> Self {
        Self { page: page.max(1) }
    }

    /// One-based page number.
    pub fn page(&self) -> u32 {
        self.page
    }

    /// Zero-based item offset for sites that paginate by offset.
    pub fn offset(&self, page_size: u32) -> u32 {
        (self.page - 1) * page_size
    }

    /// Cursor for the following page.
    pub fn next(self) -> Self {
        Self {
            page: self.page.saturating_add(1),
        }
    }
}

/// Listing card text as scraped, before any field extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawListing {
    /// Card title (usually brand, model and year).
    pub title: String,
    /// Price label text.
    pub price_text: Option<String>,
    /// Separate currency marker, when the site renders one.
    pub currency_text: Option<String>,
    /// Absolute listing URL.
    pub url: Option<String>,
    /// Absolute thumbnail URL.
    pub image: Option<String>,
    /// Location label.
    pub location: Option<String>,
    /// Spec fragments (year, mileage, transmission...) rendered on the card.
    pub details: Vec<String>,
}

/// Contract every marketplace adapter fulfils.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Marketplace this adapter scrapes.
    fn source(&self) -> Source;

    /// URL of the results page addressed by `cursor`.
    fn page_url(&self, cursor: PageCursor) -> String;

    /// Extracts listing cards from one results page.
    fn parse_page(&self, page_url: &str, html: &str) -> Result<Vec<RawListing>, FetchError>;

    /// Source-scoped identifier embedded in a listing URL.
    fn external_id(&self, listing_url: &str) -> Option<String>;

    /// Currency assumed when a card carries no currency marker.
    fn default_currency(&self) -> Currency {
        Currency::Usd
    }

    /// Normalizes one card; `None` when the card has no usable price.
    fn normalize(&self, raw: RawListing) -> Option<VehicleListing> {
        normalize_card(self.source(), raw, self.default_currency(), |url| {
            self.external_id(url)
        })
    }

    /// Downloads and parses one results page, bounded by `timeout`.
    async fn fetch_page(
        &self,
        client: &Client,
        cursor: PageCursor,
        timeout: Duration,
    ) -> Result<Vec<RawListing>, FetchError> {
        let url = self.page_url(cursor);
        debug!(source = %self.source(), page = cursor.page(), %url, "fetching page");
        let request = async {
            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|source| FetchError::Http {
                    url: url.clone(),
                    source,
                })?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.clone(),
                    status: status.as_u16(),
                });
            }
            response.text().await.map_err(|source| FetchError::Http {
                url: url.clone(),
                source,
            })
        };
        let html = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.clone(),
                timeout,
            })??;
        self.parse_page(&url, &html)
    }
}

/// Normalized listings of one page plus the number of cards dropped for lacking a price.
#[derive(Debug, Default)]
pub struct NormalizedPage {
    /// Listings that carry a price.
    pub listings: Vec<VehicleListing>,
    /// Cards discarded because no price could be read.
    pub dropped: usize,
}

/// Normalizes every card of a page, dropping the ones without a price.
pub fn normalize_page(adapter: &dyn SourceAdapter, raws: Vec<RawListing>) -> NormalizedPage {
    let mut page = NormalizedPage::default();
    for raw in raws {
        match adapter.normalize(raw) {
            Some(listing) if listing.has_price() => page.listings.push(listing),
            _ => page.dropped += 1,
        }
    }
    page
}

/// Shared field extraction used by every adapter's `normalize`.
pub fn normalize_card<F>(
    source: Source,
    raw: RawListing,
    default_currency: Currency,
    external_id: F,
) -> Option<VehicleListing>
where
    F: Fn(&str) -> Option<String>,
{
    let price_text = raw.price_text.as_deref().unwrap_or_default();
    let amount = parse_price(price_text)?;
    let currency = raw
        .currency_text
        .as_deref()
        .and_then(classify_currency)
        .or_else(|| classify_currency(price_text))
        .unwrap_or(default_currency);

    let title = clean_text(&raw.title);
    let title_text = title.as_deref().unwrap_or_default();
    let details = raw.details.join(" ");
    let everything = format!("{title_text} {details}");

    let mut listing = VehicleListing::new(source);
    match currency {
        Currency::Usd => listing.price_usd = Some(amount),
        Currency::Local => listing.price_local = Some(amount),
    }
    listing.brand = detect_brand(title_text).map(str::to_string);
    listing.model = listing
        .brand
        .as_deref()
        .and_then(|brand| extract_model(title_text, brand));
    listing.year = extract_year(&everything);
    listing.mileage = extract_mileage(&details).or_else(|| extract_mileage(title_text));
    listing.transmission = detect_transmission(&everything).map(str::to_string);
    listing.fuel_type = detect_fuel_type(&everything).map(str::to_string);
    listing.location = raw.location.as_deref().and_then(clean_text);
    listing.description = title;
    listing.images = raw.image.into_iter().collect();
    listing.external_id = raw.url.as_deref().and_then(external_id);
    listing.url = raw.url;
    Some(listing)
}

/// Adapter for `source` pointed at the live site.
pub fn adapter_for(source: Source) -> Arc<dyn SourceAdapter> {
    match source {
        Source::TuCarro => Arc::new(TuCarroAdapter::default()),
        Source::MercadoLibre => Arc::new(MercadoLibreAdapter::default()),
        Source::Autocosmos => Arc::new(AutocosmosAdapter::default()),
        Source::Buscomiauto => Arc::new(BuscomiautoAdapter::default()),
        Source::Multimarca => Arc::new(MultimarcaAdapter::default()),
    }
}
