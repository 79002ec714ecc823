//! Card extraction helpers built on `scraper`.

use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::RawListing;
use crate::error::FetchError;
use crate::extract::clean_text;

/// CSS selectors describing where a site renders its listing cards.
///
/// Every field accepts a selector list (`"a, b"`); the first match inside a card wins.
#[derive(Debug, Clone, Copy)]
pub struct CardLayout {
    /// Results container; its absence means the site layout changed.
    pub root: &'static str,
    /// One element per listing card.
    pub card: &'static str,
    /// Card title.
    pub title: &'static str,
    /// Price label.
    pub price: &'static str,
    /// Separate currency marker.
    pub currency: Option<&'static str>,
    /// Anchor carrying the listing URL.
    pub link: &'static str,
    /// Thumbnail image.
    pub image: &'static str,
    /// Location label.
    pub location: Option<&'static str>,
    /// Spec fragments (all matches are collected).
    pub details: Option<&'static str>,
}

/// Extracts raw cards from `html` following `layout`, resolving links against `base`.
pub fn parse_cards(
    layout: &CardLayout,
    base: &Url,
    page_url: &str,
    html: &str,
) -> Result<Vec<RawListing>, FetchError> {
    let document = Html::parse_document(html);
    let root_selector = selector(layout.root, page_url)?;
    let Some(root) = document.select(&root_selector).next() else {
        return Err(FetchError::Markup {
            url: page_url.to_string(),
            detail: format!("results container `{}` not found", layout.root),
        });
    };

    let card = selector(layout.card, page_url)?;
    let title = selector(layout.title, page_url)?;
    let price = selector(layout.price, page_url)?;
    let link = selector(layout.link, page_url)?;
    let image = selector(layout.image, page_url)?;
    let currency = layout
        .currency
        .map(|css| selector(css, page_url))
        .transpose()?;
    let location = layout
        .location
        .map(|css| selector(css, page_url))
        .transpose()?;
    let details = layout
        .details
        .map(|css| selector(css, page_url))
        .transpose()?;

    let mut listings = Vec::new();
    for element in root.select(&card) {
        let Some(card_title) = first_text(element, &title) else {
            continue;
        };
        let url = element
            .select(&link)
            .next()
            .and_then(|anchor| anchor.value().attr("href"))
            .and_then(|href| resolve(base, href));
        let image_url = element.select(&image).next().and_then(|img| {
            img.value()
                .attr("data-src")
                .or_else(|| img.value().attr("src"))
                .and_then(|src| resolve(base, src))
        });
        listings.push(RawListing {
            title: card_title,
            price_text: first_text(element, &price),
            currency_text: currency.as_ref().and_then(|sel| first_text(element, sel)),
            url,
            image: image_url,
            location: location.as_ref().and_then(|sel| first_text(element, sel)),
            details: details
                .as_ref()
                .map(|sel| {
                    element
                        .select(sel)
                        .filter_map(|node| clean_text(&node.text().collect::<String>()))
                        .collect()
                })
                .unwrap_or_default(),
        });
    }
    Ok(listings)
}

fn selector(css: &str, page_url: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|err| FetchError::Markup {
        url: page_url.to_string(),
        detail: format!("invalid selector `{css}`: {err:?}"),
    })
}

fn first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|node| clean_text(&node.text().collect::<String>()))
}

fn resolve(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("data:") {
        return None;
    }
    base.join(href).ok().map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LAYOUT: CardLayout = CardLayout {
        root: "ul.results",
        card: "li.card",
        title: "h2",
        price: ".price",
        currency: Some(".currency"),
        link: "a",
        image: "img",
        location: Some(".where"),
        details: Some(".spec"),
    };

    #[test]
    fn extracts_cards_and_resolves_links() {
        let html = r#"
            <ul class="results">
              <li class="card">
                <a href="/auto/usado/toyota/99"><h2> Toyota  Hilux 2020 </h2></a>
                <span class="currency">US$</span><span class="price">40.000</span>
                <img data-src="/img/99.jpg" src="data:image/gif;base64,AAAA">
                <span class="where">Valencia</span>
                <span class="spec">2020</span><span class="spec">80.000 km</span>
              </li>
              <li class="card"><span class="price">1</span></li>
            </ul>
        "#;
        let base = Url::parse("https://www.autocosmos.com.ve").unwrap();
        let cards = parse_cards(&LAYOUT, &base, "https://www.autocosmos.com.ve/p", html)
            .expect("parse cards");

        assert_eq!(
            cards,
            vec![RawListing {
                title: "Toyota Hilux 2020".to_string(),
                price_text: Some("40.000".to_string()),
                currency_text: Some("US$".to_string()),
                url: Some("https://www.autocosmos.com.ve/auto/usado/toyota/99".to_string()),
                image: Some("https://www.autocosmos.com.ve/img/99.jpg".to_string()),
                location: Some("Valencia".to_string()),
                details: vec!["2020".to_string(), "80.000 km".to_string()],
            }]
        );
    }

    #[test]
    fn missing_container_is_markup_error() {
        let base = Url::parse("https://example.test").unwrap();
        let err = parse_cards(&LAYOUT, &base, "https://example.test/", "<div>captcha</div>")
            .expect_err("layout mismatch");
        assert_eq!(err.kind(), "markup");
    }

    #[test]
    fn empty_container_is_end_of_results() {
        let base = Url::parse("https://example.test").unwrap();
        let cards = parse_cards(
            &LAYOUT,
            &base,
            "https://example.test/",
            r#"<ul class="results"></ul>"#,
        )
        .expect("empty page");
        assert!(cards.is_empty());
    }
}
