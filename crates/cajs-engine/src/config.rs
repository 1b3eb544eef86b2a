use std::time::Duration;

use cajs_adapters::{
    WattTimeConfig, WattTimeCredentials, GROQ_BASE_URL, PERPLEXITY_BASE_URL, WATTTIME_BASE_URL,
};
use cajs_storage::HttpClientConfig;

pub const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_PERPLEXITY_MODEL: &str = "sonar-pro";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub database_url: String,
    pub bind_host: String,
    pub web_port: u16,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub latitude: f64,
    pub longitude: f64,
    pub watttime_username: Option<String>,
    pub watttime_password: Option<String>,
    pub watttime_base_url: String,
    pub groq_api_key: Option<String>,
    pub groq_model: String,
    pub groq_base_url: String,
    pub perplexity_api_key: Option<String>,
    pub perplexity_model: String,
    pub perplexity_base_url: String,
    pub cors_origins: Vec<String>,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let text = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        Self {
            database_url: text("DATABASE_URL", "sqlite://cajs.db?mode=rwc"),
            bind_host: text("CAJS_BIND_HOST", "0.0.0.0"),
            web_port: var("CAJS_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            http_timeout_secs: var("CAJS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: text("CAJS_USER_AGENT", "cajs/0.1"),
            latitude: var("CAJS_LATITUDE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(37.7749),
            longitude: var("CAJS_LONGITUDE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(-122.4194),
            watttime_username: var("WATTTIME_USERNAME"),
            watttime_password: var("WATTTIME_PASSWORD"),
            watttime_base_url: text("WATTTIME_BASE_URL", WATTTIME_BASE_URL),
            groq_api_key: var("GROQ_API_KEY"),
            groq_model: text("GROQ_MODEL", DEFAULT_GROQ_MODEL),
            groq_base_url: text("GROQ_BASE_URL", GROQ_BASE_URL),
            perplexity_api_key: var("PERPLEXITY_API_KEY"),
            perplexity_model: text("PERPLEXITY_MODEL", DEFAULT_PERPLEXITY_MODEL),
            perplexity_base_url: text("PERPLEXITY_BASE_URL", PERPLEXITY_BASE_URL),
            cors_origins: var("CAJS_CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|| vec!["http://localhost:3000".to_string()]),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    /// Both halves must be present for a live WattTime source.
    pub fn watttime_credentials(&self) -> Option<WattTimeCredentials> {
        match (&self.watttime_username, &self.watttime_password) {
            (Some(username), Some(password)) => Some(WattTimeCredentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn watttime_config(&self) -> WattTimeConfig {
        WattTimeConfig {
            base_url: self.watttime_base_url.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            ..WattTimeConfig::default()
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.web_port)
    }
}
