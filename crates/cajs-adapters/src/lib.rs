//! Collaborator contracts + carbon-data and completion provider implementations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cajs_core::{CarbonSignal, CarbonUnit, ForecastPoint, SIMULATED_LOCATION};
use cajs_storage::{FailureKind, FetchError, HttpFetcher};
use chrono::{DateTime, Duration, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "cajs-adapters";

pub const WATTTIME_BASE_URL: &str = "https://api.watttime.org";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const PERPLEXITY_BASE_URL: &str = "https://api.perplexity.ai";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0} credentials are not configured")]
    MissingCredentials(&'static str),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {provider} response: {reason}")]
    Malformed {
        provider: &'static str,
        reason: String,
    },
    #[error("{0} returned an empty forecast")]
    EmptyForecast(String),
    #[error("{0} returned an empty completion")]
    EmptyCompletion(String),
}

impl AdapterError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::MissingCredentials(_))
            || matches!(self, Self::Fetch(err) if err.kind() == FailureKind::Unauthorized)
    }
}

/// Outcome of a credential/access check against a carbon-data provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProbe {
    pub credentials_configured: bool,
    pub authenticated: bool,
    pub access: Option<JsonValue>,
    pub detail: Option<String>,
}

#[async_trait]
pub trait CarbonSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn current_signal(&self) -> Result<CarbonSignal, AdapterError>;

    async fn probe(&self) -> SourceProbe;
}

#[derive(Clone)]
pub struct WattTimeCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for WattTimeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WattTimeCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WattTimeConfig {
    pub base_url: String,
    pub latitude: f64,
    pub longitude: f64,
    pub signal_type: String,
}

impl Default for WattTimeConfig {
    fn default() -> Self {
        Self {
            base_url: WATTTIME_BASE_URL.to_string(),
            latitude: 37.7749,
            longitude: -122.4194,
            signal_type: "co2_moer".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct RegionResponse {
    region: String,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    data: Vec<ForecastPoint>,
    #[serde(default)]
    meta: Option<ForecastMeta>,
}

#[derive(Debug, Deserialize)]
struct ForecastMeta {
    units: Option<String>,
}

fn unit_from_label(label: Option<&str>) -> CarbonUnit {
    match label.map(|l| l.to_ascii_lowercase()) {
        Some(l) if l.contains("kwh") => CarbonUnit::GramsPerKwh,
        _ => CarbonUnit::PoundsPerMwh,
    }
}

/// WattTime v3 client resolving a fixed coordinate to a region forecast.
#[derive(Debug)]
pub struct WattTimeSource {
    http: Arc<HttpFetcher>,
    credentials: Option<WattTimeCredentials>,
    config: WattTimeConfig,
}

impl WattTimeSource {
    const SOURCE_ID: &'static str = "watttime";

    pub fn new(
        http: Arc<HttpFetcher>,
        credentials: Option<WattTimeCredentials>,
        config: WattTimeConfig,
    ) -> Self {
        Self {
            http,
            credentials,
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn login(&self) -> Result<String, AdapterError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or(AdapterError::MissingCredentials(Self::SOURCE_ID))?;
        let request = self
            .http
            .client()
            .get(self.url("/login"))
            .basic_auth(&creds.username, Some(&creds.password));
        let login: LoginResponse = self.http.fetch_json(Self::SOURCE_ID, request).await?;
        debug!(username = %creds.username, "watttime login succeeded");
        Ok(login.token)
    }

    async fn region(&self, token: &str) -> Result<String, AdapterError> {
        let request = self
            .http
            .client()
            .get(self.url("/v3/region-from-loc"))
            .bearer_auth(token)
            .query(&[
                ("latitude", self.config.latitude.to_string()),
                ("longitude", self.config.longitude.to_string()),
                ("signal_type", self.config.signal_type.clone()),
            ]);
        let region: RegionResponse = self.http.fetch_json(Self::SOURCE_ID, request).await?;
        Ok(region.region)
    }

    async fn forecast(&self, token: &str, region: &str) -> Result<ForecastResponse, AdapterError> {
        let request = self
            .http
            .client()
            .get(self.url("/v3/forecast"))
            .bearer_auth(token)
            .query(&[("region", region), ("signal_type", self.config.signal_type.as_str())]);
        Ok(self.http.fetch_json(Self::SOURCE_ID, request).await?)
    }

    async fn my_access(&self, token: &str) -> Result<JsonValue, AdapterError> {
        let request = self
            .http
            .client()
            .get(self.url("/v3/my-access"))
            .bearer_auth(token);
        Ok(self.http.fetch_json(Self::SOURCE_ID, request).await?)
    }
}

#[async_trait]
impl CarbonSource for WattTimeSource {
    fn source_id(&self) -> &'static str {
        Self::SOURCE_ID
    }

    async fn current_signal(&self) -> Result<CarbonSignal, AdapterError> {
        let token = self.login().await?;
        let region = self.region(&token).await?;
        let forecast = self.forecast(&token, &region).await?;
        let unit = unit_from_label(forecast.meta.as_ref().and_then(|m| m.units.as_deref()));
        let points = forecast.data.len();
        let signal = CarbonSignal::from_series(region.clone(), unit, forecast.data)
            .ok_or(AdapterError::EmptyForecast(region))?;
        info!(
            location = %signal.location,
            intensity = signal.carbon_intensity,
            points,
            "live carbon signal fetched"
        );
        Ok(signal)
    }

    async fn probe(&self) -> SourceProbe {
        let credentials_configured = self.credentials.is_some();
        let token = match self.login().await {
            Ok(token) => token,
            Err(err) => {
                return SourceProbe {
                    credentials_configured,
                    authenticated: false,
                    access: None,
                    detail: Some(err.to_string()),
                }
            }
        };
        match self.my_access(&token).await {
            Ok(access) => SourceProbe {
                credentials_configured,
                authenticated: true,
                access: Some(access),
                detail: None,
            },
            Err(err) => SourceProbe {
                credentials_configured,
                authenticated: true,
                access: None,
                detail: Some(format!("access check failed: {err}")),
            },
        }
    }
}

/// Synthetic 24-hour series with a diurnal shape, tagged with [`SIMULATED_LOCATION`].
#[derive(Debug, Clone, Default)]
pub struct SimulatedCarbonSource {
    seed: Option<u64>,
}

impl SimulatedCarbonSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }

    pub fn signal_at(&self, now: DateTime<Utc>) -> CarbonSignal {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        simulate_signal(now, &mut rng)
    }
}

/// Baseline and bounds are lbs_co2_per_mwh, the unit WattTime reports.
pub fn simulate_signal<R: Rng>(now: DateTime<Utc>, rng: &mut R) -> CarbonSignal {
    let base: i64 = rng.gen_range(600..=800);
    let series = (0..96)
        .map(|i| {
            let point_time = now + Duration::minutes(15 * i);
            let time_factor = match point_time.hour() {
                0..=5 => -100,
                12..=17 => 100,
                _ => 0,
            };
            let noise: i64 = rng.gen_range(-50..=50);
            let value = (base + noise + time_factor).clamp(300, 1200);
            ForecastPoint {
                point_time,
                value: value as f64,
            }
        })
        .collect::<Vec<_>>();
    CarbonSignal::from_series(SIMULATED_LOCATION, CarbonUnit::PoundsPerMwh, series)
        .unwrap_or_else(|| unreachable!("simulated series always has 96 points"))
}

#[async_trait]
impl CarbonSource for SimulatedCarbonSource {
    fn source_id(&self) -> &'static str {
        "simulator"
    }

    async fn current_signal(&self) -> Result<CarbonSignal, AdapterError> {
        Ok(self.signal_at(Utc::now()))
    }

    async fn probe(&self) -> SourceProbe {
        SourceProbe {
            credentials_configured: false,
            authenticated: false,
            access: None,
            detail: Some("simulated data source".to_string()),
        }
    }
}

/// Single-turn chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Returns the trimmed assistant text; empty output is an error.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AdapterError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client (Groq, Perplexity).
pub struct ChatCompletionClient {
    http: Arc<HttpFetcher>,
    provider_id: String,
    api_key: String,
    model: String,
    endpoint: String,
}

impl fmt::Debug for ChatCompletionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatCompletionClient")
            .field("provider_id", &self.provider_id)
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ChatCompletionClient {
    pub fn new(
        http: Arc<HttpFetcher>,
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: &str,
    ) -> Self {
        Self {
            http,
            provider_id: provider_id.into(),
            api_key: api_key.into(),
            model: model.into(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionProvider for ChatCompletionClient {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, AdapterError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };
        let builder = self
            .http
            .client()
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body);
        let response: ChatResponse = self.http.fetch_json(&self.provider_id, builder).await?;
        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(AdapterError::EmptyCompletion(self.provider_id.clone()));
        }
        Ok(text)
    }
}
