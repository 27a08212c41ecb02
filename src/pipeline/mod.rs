use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clustering::ClusterBuilder;
use crate::config::PipelineConfig;
use crate::db::Database;
use crate::dedup::judge::{LlmTopicJudge, TopicJudge};
use crate::dedup::CrossRunDeduplicator;
use crate::error::PipelineError;
use crate::llm::LlmParams;
use crate::models::{PipelineRun, RunStatus, StepName, StepRecord};
use crate::selection;
use crate::similarity::{OllamaEmbeddingProvider, SimilarityEngine};
use crate::TARGET_PIPELINE;

/// Everything a step needs to do its work and cooperate with pause/resume.
pub struct StepContext {
    pub db: Database,
    pub run_id: String,
    pub config: PipelineConfig,
    pub cancel: watch::Receiver<bool>,
    /// Item ids already committed before an interruption of this step.
    pub checkpoint: Vec<String>,
}

/// How a step ended. Errors are returned through `Result`, not modeled here.
#[derive(Debug)]
pub enum StepOutcome {
    Completed {
        processed: i64,
        succeeded: i64,
        failed: i64,
    },
    /// The step stopped cooperatively at a safe point. The checkpoint holds
    /// the ids already committed, so resume never reprocesses them.
    Paused {
        checkpoint: Vec<String>,
        processed: i64,
        succeeded: i64,
        failed: i64,
    },
}

#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> StepName;
    async fn run(&self, ctx: &StepContext) -> Result<StepOutcome, PipelineError>;
}

/// Stage owned by an external collaborator. It participates in run records
/// so status and resume cover the whole pipeline, but does no work here.
struct PassthroughStep {
    name: StepName,
}

#[async_trait]
impl PipelineStep for PassthroughStep {
    fn name(&self) -> StepName {
        self.name
    }

    async fn run(&self, _ctx: &StepContext) -> Result<StepOutcome, PipelineError> {
        Ok(StepOutcome::Completed {
            processed: 0,
            succeeded: 0,
            failed: 0,
        })
    }
}

/// The stage this crate owns: selection, same-batch clustering, then
/// cross-run deduplication for today's candidates.
struct DedupStep {
    judge: Arc<dyn TopicJudge>,
}

#[async_trait]
impl PipelineStep for DedupStep {
    fn name(&self) -> StepName {
        StepName::Dedup
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutcome, PipelineError> {
        let day = Utc::now().date_naive();
        let pending = ctx.db.candidates_pending_dedup(day).await?;
        let candidates: Vec<_> = pending
            .into_iter()
            .filter(|item| !ctx.checkpoint.contains(&item.id))
            .collect();

        let outcome = selection::select(
            &candidates,
            ctx.config.confidence_threshold,
            ctx.config.max_selected,
            ctx.config.near_miss_margin,
        );
        for ranked in &outcome.selected {
            ctx.db
                .set_selection_rank(&ranked.item.id, ranked.selection_rank)
                .await?;
        }
        let selected: Vec<_> = outcome.selected.into_iter().map(|r| r.item).collect();

        let engine = match &ctx.config.embedding_model {
            Some(model) => SimilarityEngine::with_embeddings(Arc::new(
                OllamaEmbeddingProvider::new(
                    &ctx.config.ollama_host,
                    ctx.config.ollama_port,
                    model,
                ),
            )),
            None => SimilarityEngine::with_defaults(),
        };
        let builder = ClusterBuilder::new(&engine, ctx.config.similarity_threshold);
        let clusters = builder.build_clusters(&selected).await?;
        for cluster in &clusters {
            for member in &cluster.member_ids {
                if member != &cluster.primary_id {
                    ctx.db.mark_duplicate(member, &cluster.primary_id).await?;
                }
            }
        }
        ctx.db.insert_clusters(&ctx.run_id, &clusters).await?;

        let excluded: std::collections::HashSet<&String> = clusters
            .iter()
            .flat_map(|c| c.member_ids.iter().filter(|m| **m != c.primary_id))
            .collect();
        let survivors: Vec<_> = selected
            .iter()
            .filter(|item| !excluded.contains(&item.id))
            .cloned()
            .collect();

        let deduplicator = CrossRunDeduplicator::new(
            ctx.db.clone(),
            Arc::clone(&self.judge),
            ctx.config.signature_window,
            ctx.config.comparison_concurrency,
        );
        let result = deduplicator
            .deduplicate(day, &survivors, Some(&ctx.cancel))
            .await?;

        let processed = result.processed() as i64;
        let failed = result.errored as i64;
        if result.interrupted {
            let mut checkpoint = ctx.checkpoint.clone();
            checkpoint.extend(result.committed);
            return Ok(StepOutcome::Paused {
                checkpoint,
                processed,
                succeeded: processed - failed,
                failed,
            });
        }
        Ok(StepOutcome::Completed {
            processed,
            succeeded: processed - failed,
            failed,
        })
    }
}

/// Summary returned by an on-demand dedup pass.
#[derive(Debug)]
pub struct DedupReport {
    pub processed: usize,
    pub duplicates: usize,
    pub unique: usize,
    pub errored: usize,
    pub duplicate_rate: f64,
}

/// A run and its per-step records, for status queries.
#[derive(Debug)]
pub struct RunReport {
    pub run: PipelineRun,
    pub steps: Vec<StepRecord>,
}

/// Drives a run through its declared steps with persisted state: each step
/// transition is committed before the next step starts, so a crash or pause
/// leaves a run that `resume` can pick up where it stopped.
pub struct Pipeline {
    db: Database,
    config: PipelineConfig,
    steps: Vec<Arc<dyn PipelineStep>>,
    judge: Arc<dyn TopicJudge>,
    cancel: watch::Receiver<bool>,
}

impl Pipeline {
    pub fn new(db: Database, config: PipelineConfig, cancel: watch::Receiver<bool>) -> Self {
        let mut params = LlmParams::new(&config.ollama_host, config.ollama_port, &config.ollama_model);
        params.temperature = config.temperature;
        params.timeout_secs = config.llm_timeout_secs;
        params.max_retries = config.llm_max_retries;
        let judge: Arc<dyn TopicJudge> = Arc::new(LlmTopicJudge::new(params));
        Pipeline::with_parts(db, config, judge, cancel)
    }

    /// Assembles a pipeline around an explicit judge. The step list is the
    /// fixed declared order: external stages as passthroughs, dedup in place.
    pub fn with_parts(
        db: Database,
        config: PipelineConfig,
        judge: Arc<dyn TopicJudge>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let steps: Vec<Arc<dyn PipelineStep>> = StepName::ALL
            .iter()
            .map(|&name| match name {
                StepName::Dedup => Arc::new(DedupStep {
                    judge: Arc::clone(&judge),
                }) as Arc<dyn PipelineStep>,
                other => Arc::new(PassthroughStep { name: other }) as Arc<dyn PipelineStep>,
            })
            .collect();
        Pipeline {
            db,
            config,
            steps,
            judge,
            cancel,
        }
    }

    /// Test seam: a pipeline over an arbitrary step list.
    #[cfg(test)]
    fn with_steps(
        db: Database,
        config: PipelineConfig,
        steps: Vec<Arc<dyn PipelineStep>>,
        judge: Arc<dyn TopicJudge>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Pipeline {
            db,
            config,
            steps,
            judge,
            cancel,
        }
    }

    /// Creates a run in its declared step order and executes it. Returns the
    /// run id on completion or pause. A step failure propagates after being
    /// recorded on the run and its step, both queryable under the run id
    /// logged with the failure.
    pub async fn start(&self, mode: &str) -> Result<String, PipelineError> {
        let run = PipelineRun {
            id: Uuid::new_v4().to_string(),
            mode: mode.to_string(),
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        };
        let declared: Vec<StepName> = self.steps.iter().map(|s| s.name()).collect();
        self.db.create_run(&run, &declared).await?;
        info!(target: TARGET_PIPELINE, "Starting run {} in {} mode", run.id, mode);
        self.execute(&run.id).await?;
        Ok(run.id)
    }

    /// Resumes a paused run at the earliest non-completed resumable step.
    /// Completed steps are never recomputed.
    pub async fn resume(&self, run_id: &str) -> Result<(), PipelineError> {
        let run = self
            .db
            .get_run(run_id)
            .await?
            .ok_or_else(|| PipelineError::DataIntegrity(format!("no run '{}'", run_id)))?;
        if run.status != RunStatus::Paused {
            return Err(PipelineError::DataIntegrity(format!(
                "run {} is {}, only paused runs resume",
                run_id,
                run.status.as_str()
            )));
        }
        info!(target: TARGET_PIPELINE, "Resuming run {}", run_id);
        self.execute(run_id).await
    }

    pub async fn run_status(&self, run_id: &str) -> Result<Option<RunReport>, PipelineError> {
        let run = match self.db.get_run(run_id).await? {
            Some(run) => run,
            None => return Ok(None),
        };
        let steps = self.db.step_records(run_id).await?;
        Ok(Some(RunReport { run, steps }))
    }

    /// On-demand cross-run pass over today's pending candidates, outside any
    /// run. Used by the operational trigger.
    pub async fn trigger_dedup(&self, day: NaiveDate) -> Result<DedupReport, PipelineError> {
        let candidates = self.db.candidates_pending_dedup(day).await?;
        let deduplicator = CrossRunDeduplicator::new(
            self.db.clone(),
            Arc::clone(&self.judge),
            self.config.signature_window,
            self.config.comparison_concurrency,
        );
        let outcome = deduplicator
            .deduplicate(day, &candidates, Some(&self.cancel))
            .await?;
        Ok(DedupReport {
            processed: outcome.processed(),
            duplicates: outcome.duplicates.len(),
            unique: outcome.unique.len(),
            errored: outcome.errored,
            duplicate_rate: outcome.duplicate_rate(),
        })
    }

    async fn execute(&self, run_id: &str) -> Result<(), PipelineError> {
        self.db
            .update_run_status(run_id, RunStatus::Running, None)
            .await?;

        let records = self.db.step_records(run_id).await?;
        for record in records {
            if record.status == RunStatus::Completed {
                continue;
            }
            if record.status != RunStatus::Pending && !record.can_resume {
                warn!(
                    target: TARGET_PIPELINE,
                    "Step {} of run {} is not resumable, skipping",
                    record.step.as_str(),
                    run_id
                );
                continue;
            }

            let step = match self.steps.iter().find(|s| s.name() == record.step) {
                Some(step) => Arc::clone(step),
                None => {
                    return Err(PipelineError::DataIntegrity(format!(
                        "run {} declares step '{}' this pipeline does not provide",
                        run_id,
                        record.step.as_str()
                    )))
                }
            };

            self.db
                .update_step_status(run_id, record.step, RunStatus::Running, None)
                .await?;
            info!(target: TARGET_PIPELINE, "Run {}: step {} running", run_id, record.step.as_str());

            let ctx = StepContext {
                db: self.db.clone(),
                run_id: run_id.to_string(),
                config: self.config.clone(),
                cancel: self.cancel.clone(),
                checkpoint: record.checkpoint.clone(),
            };

            match step.run(&ctx).await {
                Ok(StepOutcome::Completed {
                    processed,
                    succeeded,
                    failed,
                }) => {
                    self.db
                        .update_step_progress(run_id, record.step, processed, succeeded, failed)
                        .await?;
                    self.db
                        .update_step_status(run_id, record.step, RunStatus::Completed, None)
                        .await?;
                }
                Ok(StepOutcome::Paused {
                    checkpoint,
                    processed,
                    succeeded,
                    failed,
                }) => {
                    self.db
                        .save_step_checkpoint(run_id, record.step, &checkpoint)
                        .await?;
                    self.db
                        .update_step_progress(run_id, record.step, processed, succeeded, failed)
                        .await?;
                    self.db
                        .update_step_status(run_id, record.step, RunStatus::Paused, None)
                        .await?;
                    self.db
                        .update_run_status(run_id, RunStatus::Paused, None)
                        .await?;
                    info!(
                        target: TARGET_PIPELINE,
                        "Run {} paused at step {} with {} items committed",
                        run_id,
                        record.step.as_str(),
                        checkpoint.len()
                    );
                    return Ok(());
                }
                Err(e) => {
                    let message = e.to_string();
                    error!(
                        target: TARGET_PIPELINE,
                        "Run {}: step {} failed: {}",
                        run_id,
                        record.step.as_str(),
                        message
                    );
                    self.db
                        .update_step_status(run_id, record.step, RunStatus::Failed, Some(&message))
                        .await?;
                    self.db
                        .update_run_status(run_id, RunStatus::Failed, Some(&message))
                        .await?;
                    return Err(e);
                }
            }
        }

        self.db
            .update_run_status(run_id, RunStatus::Completed, None)
            .await?;
        info!(target: TARGET_PIPELINE, "Run {} completed", run_id);
        Ok(())
    }
}
