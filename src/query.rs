//! Free-text query to structured filters, via a language model.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::QueryUnderstandingError;
use crate::filters::SearchFilters;
use crate::llm::{LlmProvider, ProviderRequest};

const INSTRUCTIONS: &str = r#"Eres un experto en búsqueda de vehículos en Venezuela. Extrae los parámetros de búsqueda de la consulta del usuario.

Devuelve SOLO un objeto JSON válido con estos campos (usa null si no se mencionan):
- brand: string (marca del vehículo)
- model: string (modelo específico)
- year_min: integer (año mínimo)
- year_max: integer (año máximo)
- price_max_usd: integer (precio máximo en dólares)
- transmission: "Manual" | "Automática" | null
- fuel_type: "Gasolina" | "Diesel" | "Eléctrico" | "Híbrido" | null
- color: string (color del vehículo)
- location: string (ciudad o estado)
- vehicle_type: "Sedan" | "SUV" | "Pick-up" | "Hatchback" | "Coupe" | null

Ejemplos:

Consulta: "Busco Toyota 4Runner 2018-2020 blanca menos de 35 mil"
{"brand": "Toyota", "model": "4Runner", "year_min": 2018, "year_max": 2020, "color": "blanca", "price_max_usd": 35000}

Consulta: "Pick-up diesel doble cabina que no sea de Caracas"
{"vehicle_type": "Pick-up", "fuel_type": "Diesel"}

Consulta: "Camioneta automática bajo 25 mil"
{"vehicle_type": "SUV", "transmission": "Automática", "price_max_usd": 25000}

Responde SOLO con el JSON, sin texto adicional."#;

const MAX_TOKENS: usize = 500;

/// Extracts [`SearchFilters`] from a conversational query. One-shot and stateless.
#[derive(Clone)]
pub struct FilterExtractor {
    provider: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl FilterExtractor {
    /// Wraps `provider`; each call is abandoned after `timeout`.
    pub fn new(provider: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// Filters inferred from `query`; any failure degrades to no filters.
    pub async fn extract(&self, query: &str) -> SearchFilters {
        match self.try_extract(query).await {
            Ok(filters) => {
                debug!(?filters, "extracted filters");
                filters
            }
            Err(err) => {
                warn!(error = %err, "filter extraction failed; searching without inferred filters");
                SearchFilters::default()
            }
        }
    }

    /// Filters inferred from `query`, surfacing why extraction failed.
    pub async fn try_extract(&self, query: &str) -> Result<SearchFilters, QueryUnderstandingError> {
        let prompt = format!("Consulta: \"{}\"", query.trim());
        let request = ProviderRequest {
            system: Some(INSTRUCTIONS),
            prompt: &prompt,
            temperature: 0.0,
            max_tokens: MAX_TOKENS,
        };
        let answer = tokio::time::timeout(self.timeout, self.provider.answer(&request))
            .await
            .map_err(|_| {
                QueryUnderstandingError::Provider(format!("timed out after {:?}", self.timeout))
            })?
            .map_err(|err| QueryUnderstandingError::Provider(format!("{err:#}")))?;
        parse_filters(&answer)
    }
}

/// Decodes a model answer into filters.
///
/// Tolerates markdown fences and surrounding prose, ignores unknown keys, treats `null` as
/// absent, coerces numeric strings and drops values outside their plausible range.
pub fn parse_filters(answer: &str) -> Result<SearchFilters, QueryUnderstandingError> {
    let object = first_json_object(answer).ok_or(QueryUnderstandingError::NoJson)?;
    let value: Value = serde_json::from_str(object)?;
    let Value::Object(fields) = value else {
        return Err(QueryUnderstandingError::NoJson);
    };
    let filters = SearchFilters {
        brand: text(&fields, "brand"),
        model: text(&fields, "model"),
        year_min: number(&fields, "year_min").map(|year| year.round() as i32),
        year_max: number(&fields, "year_max").map(|year| year.round() as i32),
        price_max_usd: number(&fields, "price_max_usd"),
        transmission: text(&fields, "transmission"),
        fuel_type: text(&fields, "fuel_type"),
        color: text(&fields, "color"),
        location: text(&fields, "location"),
        vehicle_type: text(&fields, "vehicle_type"),
    };
    Ok(filters.sanitized())
}

/// Slice of the first balanced `{...}` in `text`, honoring string literals.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn text(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    let parsed = match fields.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => numeric_string(s),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

fn numeric_string(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().trim_start_matches(['$', ' ']).replace([',', '_', ' '], "");
    // "35.000" is thirty-five thousand in es-VE.
    let thousands = cleaned
        .rsplit_once('.')
        .is_some_and(|(_, tail)| tail.len() == 3 && tail.chars().all(|c| c.is_ascii_digit()));
    let cleaned = if thousands {
        cleaned.replace('.', "")
    } else {
        cleaned
    };
    cleaned.parse::<f64>().ok()
}
