//! Scheduling pipeline: signal → recommendation → insights → persisted job.

pub mod config;
pub mod insights;
pub mod recommendation;
pub mod signal;

use std::sync::Arc;

use anyhow::{Context, Result};
use cajs_adapters::{
    CarbonSource, ChatCompletionClient, CompletionProvider, WattTimeSource,
};
use cajs_core::{
    AnalysisSummary, CarbonSignal, Job, JobDraft, Recommendation, Task, TaskError,
};
use cajs_storage::{HttpFetcher, JobStore, StoreError};
use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::SchedulerConfig;
pub use insights::{classify_workload, InsightsEngine, WorkloadClass};
pub use recommendation::{RecommendationEngine, RecommendationParseError};
pub use signal::{CarbonSignalAdapter, CarbonStatus, DataSource};

pub const CRATE_NAME: &str = "cajs-engine";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid task: {0}")]
    InvalidTask(#[from] TaskError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Response of a successful `schedule` call.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleOutcome {
    pub job_id: i64,
    pub task: Task,
    pub carbon_data: CarbonSignal,
    pub recommendation: Recommendation,
    pub insights: String,
    pub analysis: AnalysisSummary,
    #[serde(skip)]
    pub job: Job,
}

impl ScheduleOutcome {
    fn from_job(job: Job) -> Self {
        Self {
            job_id: job.id,
            task: job.parameters.task.clone(),
            carbon_data: job.parameters.carbon_data.clone(),
            recommendation: job.parameters.recommendation.clone(),
            insights: job.results.insights.clone(),
            analysis: job.results.analysis.clone(),
            job,
        }
    }
}

pub struct JobOrchestrator {
    store: JobStore,
    signals: CarbonSignalAdapter,
    recommendations: RecommendationEngine,
    insights: InsightsEngine,
}

impl JobOrchestrator {
    pub fn new(
        store: JobStore,
        signals: CarbonSignalAdapter,
        recommendations: RecommendationEngine,
        insights: InsightsEngine,
    ) -> Self {
        Self {
            store,
            signals,
            recommendations,
            insights,
        }
    }

    /// Store plus simulator and heuristics; no outbound calls.
    pub fn offline(store: JobStore) -> Self {
        Self::new(
            store,
            CarbonSignalAdapter::simulated_only(),
            RecommendationEngine::heuristic_only(),
            InsightsEngine::template_only(),
        )
    }

    /// Opens the store and wires every provider whose credentials are configured.
    pub async fn from_config(config: &SchedulerConfig) -> Result<Self> {
        let store = JobStore::open(&config.database_url)
            .await
            .with_context(|| format!("opening job store at {}", config.database_url))?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);

        let live: Option<Arc<dyn CarbonSource>> = config.watttime_credentials().map(|creds| {
            Arc::new(WattTimeSource::new(
                http.clone(),
                Some(creds),
                config.watttime_config(),
            )) as Arc<dyn CarbonSource>
        });
        let recommender: Option<Arc<dyn CompletionProvider>> =
            config.groq_api_key.as_ref().map(|key| {
                Arc::new(ChatCompletionClient::new(
                    http.clone(),
                    "groq",
                    key.clone(),
                    config.groq_model.clone(),
                    &config.groq_base_url,
                )) as Arc<dyn CompletionProvider>
            });
        let advisor: Option<Arc<dyn CompletionProvider>> =
            config.perplexity_api_key.as_ref().map(|key| {
                Arc::new(ChatCompletionClient::new(
                    http.clone(),
                    "perplexity",
                    key.clone(),
                    config.perplexity_model.clone(),
                    &config.perplexity_base_url,
                )) as Arc<dyn CompletionProvider>
            });

        info!(
            live_carbon = live.is_some(),
            recommendation_provider = recommender.is_some(),
            insights_provider = advisor.is_some(),
            "scheduler configured"
        );

        Ok(Self::new(
            store,
            CarbonSignalAdapter::new(live),
            RecommendationEngine::new(recommender),
            InsightsEngine::new(advisor),
        ))
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub async fn schedule(&self, task: Task) -> Result<ScheduleOutcome, EngineError> {
        self.schedule_at(task, Local::now()).await
    }

    /// Either returns the persisted job or fails with no row written.
    pub async fn schedule_at(
        &self,
        task: Task,
        now: DateTime<Local>,
    ) -> Result<ScheduleOutcome, EngineError> {
        task.validate()?;
        let span = info_span!(
            "schedule",
            request_id = %Uuid::new_v4(),
            task_name = %task.task_name
        );

        async move {
            let signal = self.signals.fetch_signal().await;
            let recommendation = self.recommendations.recommend_at(&task, &signal, now).await;
            let insight = self.insights.generate_insights(&task, &signal).await;
            let draft = JobDraft::assemble(task, signal, recommendation, insight);

            let job = self.store.create(&draft).await.map_err(|err| {
                warn!(error = %err, "persisting scheduled job failed");
                err
            })?;
            info!(
                job_id = job.id,
                scheduled_time = %job.scheduled_time,
                carbon_saved = job.carbon_saved,
                "job scheduled"
            );
            Ok(ScheduleOutcome::from_job(job))
        }
        .instrument(span)
        .await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, EngineError> {
        Ok(self.store.list().await?)
    }

    pub async fn get_job(&self, id: i64) -> Result<Job, EngineError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn cancel_job(&self, id: i64) -> Result<Job, EngineError> {
        let job = self.store.cancel(id).await?;
        info!(job_id = id, "job cancelled");
        Ok(job)
    }

    pub async fn clear_jobs(&self) -> Result<u64, EngineError> {
        let deleted = self.store.clear().await?;
        info!(deleted, "job history cleared");
        Ok(deleted)
    }

    pub async fn carbon_status(&self) -> CarbonStatus {
        self.signals.status().await
    }
}

pub async fn orchestrator_from_env() -> Result<JobOrchestrator> {
    let config = SchedulerConfig::from_env();
    JobOrchestrator::from_config(&config).await
}
