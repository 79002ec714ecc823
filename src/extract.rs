//! Best-effort field extraction from listing card text.
//!
//! Every helper returns `None` when it cannot find a plausible value; none of them fail.

use std::sync::LazyLock;

use regex::Regex;

/// Oldest model year accepted as plausible.
pub const MIN_YEAR: i32 = 1900;
/// Newest model year accepted as plausible.
pub const MAX_YEAR: i32 = 2035;

/// Brands recognized in listing titles, in preference order for ties.
pub const BRAND_VOCABULARY: &[&str] = &[
    "Toyota",
    "Chevrolet",
    "Ford",
    "Jeep",
    "Nissan",
    "Honda",
    "Hyundai",
    "Kia",
    "Mazda",
    "Mitsubishi",
    "Volkswagen",
    "Renault",
    "Peugeot",
    "Fiat",
    "Chery",
    "Suzuki",
    "Dodge",
    "RAM",
    "Mercedes-Benz",
    "BMW",
    "Audi",
    "Land Rover",
];

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})\b").expect("year pattern compiles"));
static MILEAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s*(?:km|kms|kilometros|kilómetros)\b").expect("mileage pattern compiles")
});
static CENTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.,]\d{2}$").expect("cents pattern compiles"));

/// Currency an asking price is quoted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Currency {
    /// US dollars.
    Usd,
    /// Bolívares.
    Local,
}

/// Collapses whitespace runs; `None` for blank input.
pub fn clean_text(input: &str) -> Option<String> {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Finds the vocabulary brand that appears earliest in `text` (case-insensitive substring).
pub fn detect_brand(text: &str) -> Option<&'static str> {
    let haystack = text.to_ascii_lowercase();
    BRAND_VOCABULARY
        .iter()
        .filter_map(|brand| {
            haystack
                .find(&brand.to_ascii_lowercase())
                .map(|position| (position, *brand))
        })
        .min_by(|a, b| a.0.cmp(&b.0).then(b.1.len().cmp(&a.1.len())))
        .map(|(_, brand)| brand)
}

/// Up to three words following `brand` in `title`, with year tokens removed.
pub fn extract_model(title: &str, brand: &str) -> Option<String> {
    let position = title
        .to_ascii_lowercase()
        .find(&brand.to_ascii_lowercase())?;
    let rest = &title[position + brand.len()..];
    let words: Vec<&str> = rest
        .split_whitespace()
        .filter(|word| !(word.len() == 4 && word.chars().all(|ch| ch.is_ascii_digit())))
        .take(3)
        .collect();
    clean_text(&words.join(" "))
}

/// First 4-digit token within the plausible model-year range.
pub fn extract_year(text: &str) -> Option<i32> {
    YEAR_RE
        .captures_iter(text)
        .filter_map(|caps| caps[1].parse::<i32>().ok())
        .find(|year| (MIN_YEAR..=MAX_YEAR).contains(year))
}

/// Kilometers from a `<number> km` fragment; `.`/`,` thousands separators are ignored.
pub fn extract_mileage(text: &str) -> Option<i64> {
    let normalized = text.to_lowercase().replace(['.', ','], "");
    MILEAGE_RE
        .captures(&normalized)
        .and_then(|caps| caps[1].parse::<i64>().ok())
}

/// Numeric amount from a price label such as `US$ 25.000` or `Bs. 145.000,00`.
///
/// Zero and digit-less labels ("Consultar") yield `None`.
pub fn parse_price(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let without_cents = CENTS_RE.replace(trimmed, "");
    let digits: String = without_cents
        .chars()
        .filter(|ch| ch.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits
        .parse::<f64>()
        .ok()
        .filter(|amount| amount.is_finite() && *amount > 0.0)
}

/// Currency implied by a price label or currency marker, if any.
pub fn classify_currency(marker: &str) -> Option<Currency> {
    let lowered = marker.to_lowercase();
    if lowered.contains("bs") || lowered.contains("ves") {
        Some(Currency::Local)
    } else if lowered.contains('$') || lowered.contains("usd") {
        Some(Currency::Usd)
    } else {
        None
    }
}

/// Canonical transmission label (`Automática` / `Manual`) mentioned in `text`.
pub fn detect_transmission(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    if ["automátic", "automatic", "sincrónic", "sincronic"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        Some("Automática")
    } else if lowered.contains("manual") {
        Some("Manual")
    } else {
        None
    }
}

/// Canonical fuel label (`Gasolina` / `Diesel` / `Eléctrico` / `Híbrido`) mentioned in `text`.
pub fn detect_fuel_type(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    if lowered.contains("híbrid") || lowered.contains("hibrid") || lowered.contains("hybrid") {
        Some("Híbrido")
    } else if lowered.contains("eléctric") || lowered.contains("electric") {
        Some("Eléctrico")
    } else if lowered.contains("diesel") || lowered.contains("diésel") || lowered.contains("gasoil")
    {
        Some("Diesel")
    } else if lowered.contains("gasolina") || lowered.contains("nafta") {
        Some("Gasolina")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_brand_case_insensitively() {
        assert_eq!(detect_brand("TOYOTA 4RUNNER 2019 4x4"), Some("Toyota"));
        assert_eq!(detect_brand("Vendo chevrolet aveo"), Some("Chevrolet"));
        assert_eq!(detect_brand("Bicicleta montañera"), None);
    }

    #[test]
    fn earliest_brand_wins() {
        assert_eq!(detect_brand("Jeep Grand Cherokee motor Ford"), Some("Jeep"));
    }

    #[test]
    fn model_skips_year_tokens() {
        assert_eq!(
            extract_model("Toyota 4Runner 2019 Limited 4x4 full", "Toyota").as_deref(),
            Some("4Runner Limited 4x4")
        );
        assert_eq!(extract_model("Ford", "Ford"), None);
    }

    #[test]
    fn year_must_be_plausible() {
        assert_eq!(extract_year("Corolla 2015 automático"), Some(2015));
        assert_eq!(extract_year("Ref 1234 modelo 1998"), Some(1998));
        assert_eq!(extract_year("Código 9999"), None);
        assert_eq!(extract_year(""), None);
    }

    #[test]
    fn mileage_strips_thousands_separators() {
        assert_eq!(extract_mileage("2018 · 45.000 Km"), Some(45_000));
        assert_eq!(extract_mileage("120,500 kilómetros"), Some(120_500));
        assert_eq!(extract_mileage("sin datos"), None);
    }

    #[test]
    fn price_parsing_handles_locale_formats() {
        assert_eq!(parse_price("US$ 25.000"), Some(25_000.0));
        assert_eq!(parse_price("$25,000.00"), Some(25_000.0));
        assert_eq!(parse_price("Bs. 1.450.000,50"), Some(1_450_000.0));
        assert_eq!(parse_price("Consultar"), None);
        assert_eq!(parse_price("0"), None);
    }

    #[test]
    fn transmission_and_fuel_map_to_canonical_labels() {
        assert_eq!(detect_transmission("Caja AUTOMÁTICA"), Some("Automática"));
        assert_eq!(detect_transmission("sincrónico, full equipo"), Some("Automática"));
        assert_eq!(detect_transmission("Transmisión manual"), Some("Manual"));
        assert_eq!(detect_fuel_type("Motor diésel 2.8"), Some("Diesel"));
        assert_eq!(detect_fuel_type("Hibrido enchufable"), Some("Híbrido"));
        assert_eq!(detect_fuel_type("4 cilindros"), None);
    }

    #[test]
    fn currency_markers() {
        assert_eq!(classify_currency("US$"), Some(Currency::Usd));
        assert_eq!(classify_currency("Bs."), Some(Currency::Local));
        assert_eq!(classify_currency(""), None);
    }
}
