use std::sync::Arc;

use cajs_adapters::{CompletionProvider, CompletionRequest};
use cajs_core::{CarbonSignal, Insight, InsightSource, Task};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const INSIGHTS_TEMPERATURE: f32 = 0.4;
pub const INSIGHTS_MAX_TOKENS: u32 = 300;

const SYSTEM_PROMPT: &str = "You are an expert in sustainable computing. Give 2-3 short, \
technical paragraphs of optimization advice for the workload. Stay under 200 words.";

const COMPUTE_KEYWORDS: &[&str] = &[
    "train", "model", "render", "simulat", "compil", "gpu", "inference", "ml", "neural",
    "encod", "transcod",
];

const IO_KEYWORDS: &[&str] = &[
    "backup", "etl", "sync", "transfer", "copy", "ingest", "export", "import", "migrat",
    "index", "crawl", "download", "upload", "database", "archive",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    ComputeIntensive,
    IoIntensive,
    General,
}

/// Keyword classification on word prefixes; compute keywords win ties.
pub fn classify_workload(task_name: &str) -> WorkloadClass {
    let lowered = task_name.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let hit = |keywords: &[&str]| {
        words
            .iter()
            .any(|word| keywords.iter().any(|k| word.starts_with(k)))
    };
    if hit(COMPUTE_KEYWORDS) {
        WorkloadClass::ComputeIntensive
    } else if hit(IO_KEYWORDS) {
        WorkloadClass::IoIntensive
    } else {
        WorkloadClass::General
    }
}

pub struct InsightsEngine {
    provider: Option<Arc<dyn CompletionProvider>>,
}

impl InsightsEngine {
    pub fn new(provider: Option<Arc<dyn CompletionProvider>>) -> Self {
        Self { provider }
    }

    pub fn template_only() -> Self {
        Self::new(None)
    }

    pub async fn generate_insights(&self, task: &Task, signal: &CarbonSignal) -> Insight {
        if let Some(provider) = &self.provider {
            let request = CompletionRequest {
                system: SYSTEM_PROMPT.to_string(),
                prompt: build_insights_prompt(task, signal),
                temperature: INSIGHTS_TEMPERATURE,
                max_tokens: INSIGHTS_MAX_TOKENS,
            };
            match provider.complete(&request).await {
                Ok(text) if !text.trim().is_empty() => {
                    debug!(provider = provider.provider_id(), chars = text.len(), "provider insights received");
                    return Insight {
                        text: text.trim().to_string(),
                        source: InsightSource::Provider,
                    };
                }
                Ok(_) => warn!(provider = provider.provider_id(), "empty insights; using template"),
                Err(err) => warn!(
                    provider = provider.provider_id(),
                    error = %err,
                    "insights provider failed; using template"
                ),
            }
        }
        template_insight(task, signal)
    }
}

pub fn build_insights_prompt(task: &Task, signal: &CarbonSignal) -> String {
    format!(
        "Suggest energy and carbon optimizations for this workload.\n\
         Task: {name}\n\
         Duration: {duration} hours\n\
         Resource profile: {resources}\n\
         Grid region: {location}\n\
         Current grid carbon intensity: {intensity:.1} {unit}",
        name = task.task_name,
        duration = task.duration_hours,
        resources = task.resource_usage,
        location = signal.location,
        intensity = signal.carbon_intensity,
        unit = signal.unit,
    )
}

pub fn template_insight(task: &Task, signal: &CarbonSignal) -> Insight {
    let intensity = format!("{:.1} {}", signal.carbon_intensity, signal.unit);
    let hours = task.duration_hours;
    let text = match classify_workload(&task.task_name) {
        WorkloadClass::ComputeIntensive => format!(
            "This compute-intensive workload runs for about {hours} hours while the grid sits at \
             {intensity}. Enable dynamic voltage and frequency scaling (DVFS) so processors and \
             accelerators draw less power during low-utilization phases.\n\n\
             Batch work into fewer, fuller runs and checkpoint long jobs so they can pause when \
             intensity peaks and resume in cleaner windows. Mixed-precision arithmetic and \
             right-sized instances cut energy per result further."
        ),
        WorkloadClass::IoIntensive => format!(
            "This I/O-bound workload spends most of its {hours} hours moving data while the grid \
             sits at {intensity}. Compress and deduplicate data before transfer, and prefer \
             incremental syncs over full copies.\n\n\
             Group reads and writes into large sequential batches and let storage devices idle \
             between runs. Keeping data close to compute avoids redundant network hops."
        ),
        WorkloadClass::General => format!(
            "Current grid intensity is {intensity}. For a {hours}-hour task, shifting execution \
             to overnight or other off-peak hours is the simplest way to lower its footprint.\n\n\
             Right-size the machine to the workload, shut down idle resources once the task \
             finishes, and monitor utilization to spot waste on future runs."
        ),
    };
    Insight {
        text,
        source: InsightSource::Template,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cajs_adapters::AdapterError;
    use cajs_core::CarbonUnit;
    use chrono::Utc;

    struct FixedReply(Result<&'static str, ()>);

    #[async_trait]
    impl CompletionProvider for FixedReply {
        fn provider_id(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String, AdapterError> {
            self.0
                .map(str::to_string)
                .map_err(|_| AdapterError::EmptyCompletion("fixed".into()))
        }
    }

    fn signal() -> CarbonSignal {
        CarbonSignal {
            carbon_intensity: 412.5,
            unit: CarbonUnit::GramsPerKwh,
            source_unit: CarbonUnit::PoundsPerMwh,
            location: "CAISO_NORTH".into(),
            timestamp: Utc::now(),
            forecast: vec![],
        }
    }

    #[test]
    fn workloads_are_classified_by_keyword() {
        assert_eq!(classify_workload("Train Model"), WorkloadClass::ComputeIntensive);
        assert_eq!(classify_workload("video-transcoding"), WorkloadClass::ComputeIntensive);
        assert_eq!(classify_workload("ML inference batch"), WorkloadClass::ComputeIntensive);
        assert_eq!(classify_workload("Nightly ETL"), WorkloadClass::IoIntensive);
        assert_eq!(classify_workload("database backups"), WorkloadClass::IoIntensive);
        assert_eq!(classify_workload("html report"), WorkloadClass::General);
        assert_eq!(classify_workload(""), WorkloadClass::General);
    }

    #[tokio::test]
    async fn compute_template_mentions_dvfs_and_current_conditions() {
        let insight = InsightsEngine::template_only()
            .generate_insights(&Task::new("Train Model", 4.0, "GPU-heavy"), &signal())
            .await;
        assert_eq!(insight.source, InsightSource::Template);
        assert!(insight.text.contains("DVFS"));
        assert!(insight.text.contains("412.5 gCO2/kWh"));
        assert!(insight.text.contains("4 hours"));
    }

    #[tokio::test]
    async fn provider_text_is_returned_trimmed() {
        let engine = InsightsEngine::new(Some(Arc::new(FixedReply(Ok("  Use spot capacity.\n")))));
        let insight = engine.generate_insights(&Task::new("etl", 1.0, "low"), &signal()).await;
        assert_eq!(insight.source, InsightSource::Provider);
        assert_eq!(insight.text, "Use spot capacity.");
    }

    #[tokio::test]
    async fn blank_or_failed_provider_output_uses_template() {
        for reply in [Ok("   "), Err(())] {
            let engine = InsightsEngine::new(Some(Arc::new(FixedReply(reply))));
            let insight = engine.generate_insights(&Task::new("sync files", 2.0, "low"), &signal()).await;
            assert_eq!(insight.source, InsightSource::Template);
            assert!(!insight.text.is_empty());
        }
    }
}
