//! Start-time recommendation with a provider-first degradation ladder.
//!
//! Rungs, in order: provider result (validated, arithmetic recomputed),
//! heuristic after a validation failure, heuristic when no provider exists,
//! and a minimal "start in an hour" fallback when the provider call itself fails.

use std::sync::Arc;

use cajs_adapters::{AdapterError, CompletionProvider, CompletionRequest};
use cajs_core::{
    estimate_savings, AlternativeWindow, CarbonSignal, Recommendation, RecommendationSource,
    SustainabilityImpact, Task,
};
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

pub const RECOMMENDATION_TEMPERATURE: f32 = 0.3;
pub const RECOMMENDATION_MAX_TOKENS: u32 = 1000;

const NO_PROVIDER_CONFIDENCE: f64 = 0.5;
const HISTORICAL_CONFIDENCE: f64 = 0.7;
const FALLBACK_CONFIDENCE: f64 = 0.3;
const HEURISTIC_INTENSITY_FACTOR: f64 = 0.8;
const ALTERNATIVE_INTENSITY_FACTOR: f64 = 1.1;

const SYSTEM_PROMPT: &str = "You are a carbon-aware scheduling assistant. \
Respond with a single JSON object and nothing else: no prose, no markdown.";

const NO_PROVIDER_REASONING: &str = "No recommendation provider is configured; scheduled for \
02:00 local time, when grid demand and carbon intensity are typically lowest.";

const HISTORICAL_REASONING: &str = "Based on historical patterns, early morning hours \
(around 02:00 local time) typically have the lowest grid carbon intensity.";

#[derive(Debug, Error)]
pub enum RecommendationParseError {
    #[error("response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("response is not a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type")]
    InvalidField(&'static str),
}

pub struct RecommendationEngine {
    provider: Option<Arc<dyn CompletionProvider>>,
}

impl RecommendationEngine {
    pub fn new(provider: Option<Arc<dyn CompletionProvider>>) -> Self {
        Self { provider }
    }

    pub fn heuristic_only() -> Self {
        Self::new(None)
    }

    pub async fn recommend(&self, task: &Task, signal: &CarbonSignal) -> Recommendation {
        self.recommend_at(task, signal, Local::now()).await
    }

    pub async fn recommend_at(
        &self,
        task: &Task,
        signal: &CarbonSignal,
        now: DateTime<Local>,
    ) -> Recommendation {
        let Some(provider) = &self.provider else {
            return heuristic_recommendation(
                task,
                signal,
                now,
                NO_PROVIDER_CONFIDENCE,
                NO_PROVIDER_REASONING,
            );
        };

        let request = CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(task, signal, now),
            temperature: RECOMMENDATION_TEMPERATURE,
            max_tokens: RECOMMENDATION_MAX_TOKENS,
        };

        match provider.complete(&request).await {
            Ok(text) => match parse_recommendation(&text, task, signal, now) {
                Ok(recommendation) => {
                    info!(
                        provider = provider.provider_id(),
                        start = %recommendation.recommended_start_time,
                        savings_kg = recommendation.carbon_savings_estimate,
                        "provider recommendation accepted"
                    );
                    recommendation
                }
                Err(err) => {
                    warn!(
                        provider = provider.provider_id(),
                        error = %err,
                        "provider recommendation failed validation; using heuristic"
                    );
                    heuristic_recommendation(
                        task,
                        signal,
                        now,
                        HISTORICAL_CONFIDENCE,
                        HISTORICAL_REASONING,
                    )
                }
            },
            Err(err) => {
                warn!(
                    provider = provider.provider_id(),
                    error = %err,
                    "recommendation provider unavailable; using minimal fallback"
                );
                minimal_fallback(signal, now, &err)
            }
        }
    }
}

pub fn build_prompt(task: &Task, signal: &CarbonSignal, now: DateTime<Local>) -> String {
    format!(
        "Recommend the best time to start this compute task to minimize carbon emissions.\n\
         \n\
         Task:\n\
         - name: {name}\n\
         - duration_hours: {duration}\n\
         - resource_usage: {resources}\n\
         \n\
         Current grid conditions:\n\
         - location: {location}\n\
         - carbon_intensity: {intensity:.1} {unit}\n\
         - measured_at: {measured}\n\
         - current_time: {now}\n\
         \n\
         Reply with JSON of exactly this shape:\n\
         {{\n  \"recommended_start_time\": \"ISO 8601 datetime\",\n  \
         \"expected_intensity\": number,\n  \"carbon_savings_estimate\": number,\n  \
         \"confidence_score\": number between 0 and 1,\n  \"reasoning\": \"string\",\n  \
         \"sustainability_impact\": {{\"carbon_reduction_percentage\": number, \
         \"equivalent_trees_planted\": number, \"energy_cost_savings\": number}},\n  \
         \"alternative_windows\": [{{\"start_time\": \"ISO 8601 datetime\", \
         \"expected_intensity\": number, \"reason\": \"string\"}}]\n}}",
        name = task.task_name,
        duration = task.duration_hours,
        resources = task.resource_usage,
        location = signal.location,
        intensity = signal.carbon_intensity,
        unit = signal.unit,
        measured = signal.timestamp.to_rfc3339(),
        now = now.to_rfc3339(),
    )
}

/// Drops ```` ```json ```` / ```` ``` ```` wrappers some models add around JSON.
pub fn strip_code_fences(text: &str) -> &str {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = rest.strip_prefix("json").unwrap_or(rest);
    }
    if let Some(rest) = body.trim_end().strip_suffix("```") {
        body = rest;
    }
    body.trim()
}

/// Validates a provider reply and recomputes every derived number from it.
pub fn parse_recommendation(
    text: &str,
    task: &Task,
    signal: &CarbonSignal,
    now: DateTime<Local>,
) -> Result<Recommendation, RecommendationParseError> {
    let value: JsonValue = serde_json::from_str(strip_code_fences(text))?;
    let object = value.as_object().ok_or(RecommendationParseError::NotAnObject)?;

    let start_raw = required(object, "recommended_start_time")?
        .as_str()
        .ok_or(RecommendationParseError::InvalidField("recommended_start_time"))?;
    let expected = required_number(object, "expected_intensity")?.max(0.0);
    let confidence = required_number(object, "confidence_score")?.clamp(0.0, 1.0);
    let reasoning = required(object, "reasoning")?
        .as_str()
        .ok_or(RecommendationParseError::InvalidField("reasoning"))?
        .to_string();

    let recommended_start_time =
        parse_start_time(start_raw).unwrap_or_else(|| one_hour_after(now));

    let baseline = signal.carbon_intensity;
    let savings = estimate_savings(baseline, expected, task.duration_hours, task.resource_tier());

    Ok(Recommendation {
        recommended_start_time,
        expected_intensity: expected,
        carbon_savings_estimate: savings,
        confidence_score: confidence,
        reasoning,
        sustainability_impact: SustainabilityImpact::from_savings(baseline, expected, savings),
        alternative_windows: parse_alternative_windows(object.get("alternative_windows")),
        source: RecommendationSource::Provider,
    })
}

fn required<'a>(
    object: &'a Map<String, JsonValue>,
    field: &'static str,
) -> Result<&'a JsonValue, RecommendationParseError> {
    match object.get(field) {
        None | Some(JsonValue::Null) => Err(RecommendationParseError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

fn required_number(
    object: &Map<String, JsonValue>,
    field: &'static str,
) -> Result<f64, RecommendationParseError> {
    number(required(object, field)?).ok_or(RecommendationParseError::InvalidField(field))
}

/// JSON number or numeric string; non-finite values are rejected.
fn number(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// RFC 3339, or a naive ISO datetime read as local time.
pub fn parse_start_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
}

fn parse_alternative_windows(value: Option<&JsonValue>) -> Vec<AlternativeWindow> {
    let Some(JsonValue::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let object = item.as_object()?;
            let start_time = parse_start_time(object.get("start_time")?.as_str()?)?;
            let expected_intensity = number(object.get("expected_intensity")?)?.max(0.0);
            let reason = object
                .get("reason")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            Some(AlternativeWindow {
                start_time,
                expected_intensity,
                reason,
            })
        })
        .collect()
}

fn one_hour_after(now: DateTime<Local>) -> DateTime<Utc> {
    (now + Duration::hours(1)).with_timezone(&Utc)
}

/// 02:00 local today, or tomorrow once today's 02:00 has passed.
pub fn next_low_carbon_start(now: DateTime<Local>) -> DateTime<Utc> {
    let at_two = |date: chrono::NaiveDate| {
        date.and_hms_opt(2, 0, 0)
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
    };
    let today = at_two(now.date_naive());
    let start = match today {
        Some(candidate) if candidate >= now => Some(candidate),
        _ => now.date_naive().succ_opt().and_then(at_two),
    };
    start
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| one_hour_after(now))
}

pub fn heuristic_recommendation(
    task: &Task,
    signal: &CarbonSignal,
    now: DateTime<Local>,
    confidence: f64,
    reasoning: &str,
) -> Recommendation {
    let baseline = signal.carbon_intensity;
    let expected = baseline * HEURISTIC_INTENSITY_FACTOR;
    let savings = estimate_savings(baseline, expected, task.duration_hours, task.resource_tier());
    let start = next_low_carbon_start(now);
    Recommendation {
        recommended_start_time: start,
        expected_intensity: expected,
        carbon_savings_estimate: savings,
        confidence_score: confidence.clamp(0.0, 1.0),
        reasoning: reasoning.to_string(),
        sustainability_impact: SustainabilityImpact::from_savings(baseline, expected, savings),
        alternative_windows: vec![AlternativeWindow {
            start_time: start + Duration::days(1),
            expected_intensity: expected * ALTERNATIVE_INTENSITY_FACTOR,
            reason: "Next-day early morning window with similar off-peak grid conditions"
                .to_string(),
        }],
        source: RecommendationSource::Heuristic,
    }
}

pub fn minimal_fallback(
    signal: &CarbonSignal,
    now: DateTime<Local>,
    error: &AdapterError,
) -> Recommendation {
    let baseline = signal.carbon_intensity;
    Recommendation {
        recommended_start_time: one_hour_after(now),
        expected_intensity: baseline,
        carbon_savings_estimate: 0.0,
        confidence_score: FALLBACK_CONFIDENCE,
        reasoning: format!("Recommendation provider unavailable ({error}); starting in one hour."),
        sustainability_impact: SustainabilityImpact::from_savings(baseline, baseline, 0.0),
        alternative_windows: Vec::new(),
        source: RecommendationSource::Fallback,
    }
}
