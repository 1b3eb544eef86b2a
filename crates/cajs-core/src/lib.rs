//! Core domain model and savings arithmetic for CAJS.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cajs-core";

/// Location label carried by every signal the simulator produces.
pub const SIMULATED_LOCATION: &str = "SIMULATED_CAISO_NORTH";

/// Money saved per unit of avoided carbon (USD).
pub const SAVINGS_RATE_USD: f64 = 0.05;

/// Tree-years needed to absorb one kilogram of CO2.
pub const TREES_PER_KG_CO2: f64 = 0.0165;

const LBS_PER_MWH_TO_G_PER_KWH: f64 = 0.453_592_37;

/// Compute task submitted for carbon-aware scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_name: String,
    pub duration_hours: f64,
    pub resource_usage: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("task_name must not be empty")]
    EmptyName,
    #[error("duration_hours must be a positive number, got {0}")]
    InvalidDuration(f64),
}

impl Task {
    pub fn new(
        task_name: impl Into<String>,
        duration_hours: f64,
        resource_usage: impl Into<String>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            duration_hours,
            resource_usage: resource_usage.into(),
        }
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if self.task_name.trim().is_empty() {
            return Err(TaskError::EmptyName);
        }
        if !self.duration_hours.is_finite() || self.duration_hours <= 0.0 {
            return Err(TaskError::InvalidDuration(self.duration_hours));
        }
        Ok(())
    }

    pub fn resource_tier(&self) -> ResourceTier {
        ResourceTier::from_label(&self.resource_usage)
    }
}

/// Coarse resource classification used to scale savings estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceTier {
    High,
    Medium,
    Low,
    Default,
}

impl ResourceTier {
    /// Exact, case-insensitive match on `high`/`medium`/`low`; anything else is `Default`.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        if label.eq_ignore_ascii_case("high") {
            Self::High
        } else if label.eq_ignore_ascii_case("medium") {
            Self::Medium
        } else if label.eq_ignore_ascii_case("low") {
            Self::Low
        } else {
            Self::Default
        }
    }

    pub fn factor(self) -> f64 {
        match self {
            Self::High => 1.0,
            Self::Medium => 0.6,
            Self::Low => 0.3,
            Self::Default => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CarbonUnit {
    #[serde(rename = "gCO2/kWh")]
    GramsPerKwh,
    #[serde(rename = "lbs_co2_per_mwh")]
    PoundsPerMwh,
}

impl CarbonUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GramsPerKwh => "gCO2/kWh",
            Self::PoundsPerMwh => "lbs_co2_per_mwh",
        }
    }

    pub fn to_grams_per_kwh(self, value: f64) -> f64 {
        match self {
            Self::GramsPerKwh => value,
            Self::PoundsPerMwh => value * LBS_PER_MWH_TO_G_PER_KWH,
        }
    }
}

impl fmt::Display for CarbonUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub point_time: DateTime<Utc>,
    pub value: f64,
}

/// Grid carbon-intensity reading, always expressed in gCO2/kWh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarbonSignal {
    pub carbon_intensity: f64,
    pub unit: CarbonUnit,
    pub source_unit: CarbonUnit,
    pub location: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub forecast: Vec<ForecastPoint>,
}

impl CarbonSignal {
    /// Normalizes a provider series into a signal; the first point is the current reading.
    ///
    /// Returns `None` for an empty series.
    pub fn from_series(
        location: impl Into<String>,
        source_unit: CarbonUnit,
        series: Vec<ForecastPoint>,
    ) -> Option<Self> {
        let forecast = series
            .into_iter()
            .map(|p| ForecastPoint {
                point_time: p.point_time,
                value: source_unit.to_grams_per_kwh(p.value).max(0.0),
            })
            .collect::<Vec<_>>();
        let current = forecast.first()?.clone();
        Some(Self {
            carbon_intensity: current.value,
            unit: CarbonUnit::GramsPerKwh,
            source_unit,
            location: location.into(),
            timestamp: current.point_time,
            forecast,
        })
    }

    pub fn is_simulated(&self) -> bool {
        self.location == SIMULATED_LOCATION
    }
}

/// Estimated avoided emissions in kg CO2, clamped at zero.
///
/// Intensities are gCO2/kWh and one tier-hour is taken as one kWh, so the
/// division by 1000 yields kilograms.
pub fn estimate_savings(
    baseline: f64,
    optimized: f64,
    duration_hours: f64,
    tier: ResourceTier,
) -> f64 {
    let savings = (baseline - optimized) * duration_hours * tier.factor() / 1000.0;
    if savings.is_finite() && savings > 0.0 {
        savings
    } else {
        0.0
    }
}

/// Percentage reduction from baseline, or `None` when the baseline is not positive.
pub fn reduction_percentage(baseline: f64, optimized: f64) -> Option<f64> {
    if !baseline.is_finite() || !optimized.is_finite() || baseline <= 0.0 {
        return None;
    }
    Some(round2((baseline - optimized) / baseline * 100.0))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SustainabilityImpact {
    pub carbon_reduction_percentage: Option<f64>,
    pub equivalent_trees_planted: f64,
    pub energy_cost_savings: f64,
}

impl SustainabilityImpact {
    pub fn from_savings(baseline: f64, optimized: f64, savings_kg: f64) -> Self {
        Self {
            carbon_reduction_percentage: reduction_percentage(baseline, optimized),
            equivalent_trees_planted: round2(savings_kg * TREES_PER_KG_CO2),
            energy_cost_savings: round2(savings_kg * SAVINGS_RATE_USD),
        }
    }

    pub fn zero() -> Self {
        Self {
            carbon_reduction_percentage: Some(0.0),
            equivalent_trees_planted: 0.0,
            energy_cost_savings: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeWindow {
    pub start_time: DateTime<Utc>,
    pub expected_intensity: f64,
    #[serde(default)]
    pub reason: String,
}

/// Which rung of the degradation ladder produced a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationSource {
    Provider,
    Heuristic,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub recommended_start_time: DateTime<Utc>,
    pub expected_intensity: f64,
    pub carbon_savings_estimate: f64,
    pub confidence_score: f64,
    pub reasoning: String,
    pub sustainability_impact: SustainabilityImpact,
    #[serde(default)]
    pub alternative_windows: Vec<AlternativeWindow>,
    pub source: RecommendationSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightSource {
    Provider,
    Template,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub text: String,
    pub source: InsightSource,
}

/// Baseline-versus-optimized comparison; never stored as its own source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub baseline_intensity: f64,
    pub optimized_intensity: f64,
    pub carbon_difference: f64,
    pub money_saved: f64,
    pub unit: CarbonUnit,
}

impl AnalysisSummary {
    pub fn derive(signal: &CarbonSignal, recommendation: &Recommendation) -> Self {
        let baseline = signal.carbon_intensity;
        let optimized = recommendation.expected_intensity;
        let carbon_difference = baseline - optimized;
        Self {
            baseline_intensity: baseline,
            optimized_intensity: optimized,
            carbon_difference,
            money_saved: carbon_difference * SAVINGS_RATE_USD,
            unit: signal.unit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job status {0:?}")]
pub struct UnknownJobStatus(pub String);

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownJobStatus(other.to_string())),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision trace: everything that went into choosing the schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    pub task: Task,
    pub carbon_data: CarbonSignal,
    pub recommendation: Recommendation,
    pub confidence_score: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    pub insights: String,
    pub insights_source: InsightSource,
    pub analysis: AnalysisSummary,
}

/// Fully computed job awaiting persistence; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDraft {
    pub task_name: String,
    pub status: JobStatus,
    pub duration_hours: f64,
    pub resource_usage: String,
    pub scheduled_time: DateTime<Utc>,
    pub carbon_intensity: f64,
    pub carbon_saved: f64,
    pub parameters: JobParameters,
    pub results: JobResults,
}

impl JobDraft {
    /// Top-level columns and the nested trace are derived from the same values here.
    pub fn assemble(
        task: Task,
        signal: CarbonSignal,
        recommendation: Recommendation,
        insight: Insight,
    ) -> Self {
        let analysis = AnalysisSummary::derive(&signal, &recommendation);
        Self {
            task_name: task.task_name.clone(),
            status: JobStatus::Pending,
            duration_hours: task.duration_hours,
            resource_usage: task.resource_usage.clone(),
            scheduled_time: recommendation.recommended_start_time,
            carbon_intensity: signal.carbon_intensity,
            carbon_saved: recommendation.carbon_savings_estimate.max(0.0),
            results: JobResults {
                insights: insight.text,
                insights_source: insight.source,
                analysis,
            },
            parameters: JobParameters {
                confidence_score: recommendation.confidence_score,
                reasoning: recommendation.reasoning.clone(),
                task,
                carbon_data: signal,
                recommendation,
            },
        }
    }
}

/// Persisted scheduling decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub task_name: String,
    pub status: JobStatus,
    pub duration_hours: f64,
    pub resource_usage: String,
    pub scheduled_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub carbon_intensity: f64,
    pub carbon_saved: f64,
    pub parameters: JobParameters,
    pub results: JobResults,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_cancellable(&self) -> bool {
        self.status == JobStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, hour, 0, 0).single().unwrap()
    }

    fn signal(intensity: f64) -> CarbonSignal {
        CarbonSignal {
            carbon_intensity: intensity,
            unit: CarbonUnit::GramsPerKwh,
            source_unit: CarbonUnit::GramsPerKwh,
            location: "CAISO_NORTH".into(),
            timestamp: ts(14),
            forecast: vec![],
        }
    }

    fn recommendation(expected: f64, savings: f64) -> Recommendation {
        Recommendation {
            recommended_start_time: ts(2),
            expected_intensity: expected,
            carbon_savings_estimate: savings,
            confidence_score: 0.5,
            reasoning: "early morning".into(),
            sustainability_impact: SustainabilityImpact::zero(),
            alternative_windows: vec![],
            source: RecommendationSource::Heuristic,
        }
    }

    #[test]
    fn tier_matches_case_insensitively() {
        assert_eq!(ResourceTier::from_label("Medium"), ResourceTier::Medium);
        assert_eq!(ResourceTier::from_label("HIGH"), ResourceTier::High);
        assert_eq!(ResourceTier::from_label(" low "), ResourceTier::Low);
        assert_eq!(ResourceTier::from_label("Medium").factor(), 0.6);
    }

    #[test]
    fn unknown_tier_labels_default_to_half() {
        for label in ["GPU-heavy", "", "highest", "med", "CPU bound"] {
            assert_eq!(ResourceTier::from_label(label), ResourceTier::Default, "{label}");
            assert_eq!(ResourceTier::from_label(label).factor(), 0.5);
        }
    }

    #[test]
    fn savings_are_never_negative_and_zero_without_difference() {
        for tier in [ResourceTier::High, ResourceTier::Medium, ResourceTier::Low, ResourceTier::Default] {
            for (baseline, optimized) in [(400.0, 320.0), (250.0, 250.0), (0.0, 0.0), (300.0, 0.0)] {
                for duration in [0.25, 1.0, 8.0] {
                    let s = estimate_savings(baseline, optimized, duration, tier);
                    assert!(s >= 0.0);
                    if baseline == optimized {
                        assert_eq!(s, 0.0);
                    }
                }
            }
        }
        assert_eq!(estimate_savings(300.0, 450.0, 2.0, ResourceTier::High), 0.0);
        assert_eq!(estimate_savings(f64::NAN, 1.0, 2.0, ResourceTier::High), 0.0);
    }

    #[test]
    fn savings_formula_scales_by_tier_and_duration() {
        let high = estimate_savings(400.0, 320.0, 4.0, ResourceTier::High);
        assert!((high - 0.32).abs() < 1e-9);
        let default = estimate_savings(400.0, 320.0, 4.0, ResourceTier::Default);
        assert!((default - 0.16).abs() < 1e-9);
    }

    #[test]
    fn reduction_percentage_is_not_computable_without_positive_baseline() {
        assert_eq!(reduction_percentage(0.0, 0.0), None);
        assert_eq!(reduction_percentage(-5.0, -4.0), None);
        assert_eq!(reduction_percentage(400.0, 320.0), Some(20.0));
        let impact = SustainabilityImpact::from_savings(0.0, 0.0, 0.0);
        assert_eq!(impact.carbon_reduction_percentage, None);
        assert_eq!(impact.energy_cost_savings, 0.0);
    }

    #[test]
    fn pounds_per_mwh_series_is_normalized_to_grams_per_kwh() {
        let series = vec![
            ForecastPoint { point_time: ts(14), value: 1000.0 },
            ForecastPoint { point_time: ts(15), value: 500.0 },
        ];
        let signal = CarbonSignal::from_series("CAISO_NORTH", CarbonUnit::PoundsPerMwh, series).unwrap();
        assert!((signal.carbon_intensity - 453.59237).abs() < 1e-6);
        assert_eq!(signal.unit, CarbonUnit::GramsPerKwh);
        assert_eq!(signal.source_unit, CarbonUnit::PoundsPerMwh);
        assert_eq!(signal.timestamp, ts(14));
        assert_eq!(signal.forecast.len(), 2);
        assert!(!signal.is_simulated());
        assert!(CarbonSignal::from_series("x", CarbonUnit::GramsPerKwh, vec![]).is_none());
    }

    #[test]
    fn signal_serializes_with_wire_unit_labels() {
        let json = serde_json::to_value(signal(400.0)).unwrap();
        assert_eq!(json["unit"], "gCO2/kWh");
        assert_eq!(json["carbon_intensity"], 400.0);
    }

    #[test]
    fn assembled_draft_keeps_trace_and_columns_consistent() {
        let task = Task::new("Train Model", 4.0, "high");
        let rec = recommendation(320.0, 0.32);
        let insight = Insight {
            text: "Use DVFS".into(),
            source: InsightSource::Template,
        };
        let draft = JobDraft::assemble(task.clone(), signal(400.0), rec.clone(), insight);

        assert_eq!(draft.status, JobStatus::Pending);
        assert_eq!(draft.scheduled_time, draft.parameters.recommendation.recommended_start_time);
        assert_eq!(draft.carbon_intensity, draft.parameters.carbon_data.carbon_intensity);
        assert_eq!(draft.carbon_saved, draft.parameters.recommendation.carbon_savings_estimate);
        assert_eq!(draft.parameters.confidence_score, rec.confidence_score);
        assert_eq!(draft.parameters.task, task);
        assert_eq!(draft.results.analysis.carbon_difference, 80.0);
        assert!((draft.results.analysis.money_saved - 4.0).abs() < 1e-9);
    }

    #[test]
    fn task_validation_rejects_empty_names_and_bad_durations() {
        assert_eq!(Task::new("  ", 1.0, "low").validate(), Err(TaskError::EmptyName));
        assert!(matches!(
            Task::new("etl", 0.0, "low").validate(),
            Err(TaskError::InvalidDuration(_))
        ));
        assert!(Task::new("etl", f64::INFINITY, "low").validate().is_err());
        assert!(Task::new("etl", 1.5, "low").validate().is_ok());
    }

    #[test]
    fn job_status_text_round_trips() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
            assert_eq!(serde_json::to_value(status).unwrap(), status.as_str());
        }
        assert!("PENDING".parse::<JobStatus>().is_err());
    }
}
