use std::sync::Arc;

use cajs_adapters::{CarbonSource, SimulatedCarbonSource};
use cajs_core::{CarbonSignal, CarbonUnit};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Live,
    Simulated,
}

/// Diagnostic view of the carbon-data provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarbonStatus {
    pub credentials_configured: bool,
    pub authenticated: bool,
    pub access: Option<JsonValue>,
    pub data_source: DataSource,
    pub location: String,
    pub carbon_intensity: f64,
    pub unit: CarbonUnit,
    pub detail: Option<String>,
}

/// Produces a signal for every request, falling back to the simulator.
pub struct CarbonSignalAdapter {
    live: Option<Arc<dyn CarbonSource>>,
    simulator: SimulatedCarbonSource,
}

impl CarbonSignalAdapter {
    pub fn new(live: Option<Arc<dyn CarbonSource>>) -> Self {
        Self {
            live,
            simulator: SimulatedCarbonSource::new(),
        }
    }

    pub fn simulated_only() -> Self {
        Self::new(None)
    }

    pub fn with_simulator(mut self, simulator: SimulatedCarbonSource) -> Self {
        self.simulator = simulator;
        self
    }

    pub async fn fetch_signal(&self) -> CarbonSignal {
        if let Some(source) = &self.live {
            match source.current_signal().await {
                Ok(signal) => return signal,
                Err(err) => warn!(
                    source_id = source.source_id(),
                    error = %err,
                    auth_failure = err.is_auth_failure(),
                    "carbon source failed; using simulated signal"
                ),
            }
        }
        let signal = self.simulator.signal_at(chrono::Utc::now());
        info!(intensity = signal.carbon_intensity, "simulated carbon signal generated");
        signal
    }

    pub async fn status(&self) -> CarbonStatus {
        let probe = match &self.live {
            Some(source) => Some(source.probe().await),
            None => None,
        };
        let signal = self.fetch_signal().await;
        let data_source = if signal.is_simulated() {
            DataSource::Simulated
        } else {
            DataSource::Live
        };
        match probe {
            Some(probe) => CarbonStatus {
                credentials_configured: probe.credentials_configured,
                authenticated: probe.authenticated,
                access: probe.access,
                data_source,
                location: signal.location,
                carbon_intensity: signal.carbon_intensity,
                unit: signal.unit,
                detail: probe.detail,
            },
            None => CarbonStatus {
                credentials_configured: false,
                authenticated: false,
                access: None,
                data_source,
                location: signal.location,
                carbon_intensity: signal.carbon_intensity,
                unit: signal.unit,
                detail: Some("no carbon data provider configured".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cajs_adapters::{AdapterError, SourceProbe};
    use cajs_core::ForecastPoint;
    use chrono::Utc;

    struct FixedSource(Option<f64>);

    #[async_trait]
    impl CarbonSource for FixedSource {
        fn source_id(&self) -> &'static str {
            "fixed"
        }

        async fn current_signal(&self) -> Result<CarbonSignal, AdapterError> {
            let value = self.0.ok_or(AdapterError::MissingCredentials("fixed"))?;
            let point = ForecastPoint {
                point_time: Utc::now(),
                value,
            };
            CarbonSignal::from_series("CAISO_NORTH", CarbonUnit::GramsPerKwh, vec![point])
                .ok_or_else(|| AdapterError::EmptyForecast("CAISO_NORTH".into()))
        }

        async fn probe(&self) -> SourceProbe {
            SourceProbe {
                credentials_configured: self.0.is_some(),
                authenticated: self.0.is_some(),
                access: None,
                detail: None,
            }
        }
    }

    #[tokio::test]
    async fn live_signal_is_used_when_available() {
        let adapter = CarbonSignalAdapter::new(Some(Arc::new(FixedSource(Some(412.0)))));
        let signal = adapter.fetch_signal().await;
        assert_eq!(signal.carbon_intensity, 412.0);
        assert!(!signal.is_simulated());

        let status = adapter.status().await;
        assert_eq!(status.data_source, DataSource::Live);
        assert!(status.authenticated);
    }

    #[tokio::test]
    async fn failing_source_falls_back_to_simulator() {
        let adapter = CarbonSignalAdapter::new(Some(Arc::new(FixedSource(None))));
        let signal = adapter.fetch_signal().await;
        assert!(signal.is_simulated());
        assert_eq!(signal.forecast.len(), 96);
        assert!(signal.carbon_intensity > 0.0);

        let status = adapter.status().await;
        assert_eq!(status.data_source, DataSource::Simulated);
        assert!(!status.credentials_configured);
    }

    #[tokio::test]
    async fn status_without_provider_reports_simulated_data() {
        let status = CarbonSignalAdapter::simulated_only().status().await;
        assert_eq!(status.data_source, DataSource::Simulated);
        assert_eq!(status.location, cajs_core::SIMULATED_LOCATION);
        assert_eq!(status.unit, CarbonUnit::GramsPerKwh);
        assert!(status.detail.is_some());
    }
}
