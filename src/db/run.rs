use chrono::{Duration, Utc};
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::core::{parse_timestamp, Database};
use crate::models::{PipelineRun, RunStatus, StepName, StepRecord};
use crate::TARGET_DB;

fn step_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StepRecord, sqlx::Error> {
    let step_raw: String = row.get("step");
    let status_raw: String = row.get("status");
    let checkpoint_raw: String = row.get("checkpoint");
    let step = StepName::parse(&step_raw)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown step '{}'", step_raw).into()))?;
    let status = RunStatus::parse(&status_raw)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown status '{}'", status_raw).into()))?;
    let checkpoint: Vec<String> =
        serde_json::from_str(&checkpoint_raw).map_err(|e| sqlx::Error::Decode(e.into()))?;

    let started_raw: Option<String> = row.get("started_at");
    let completed_raw: Option<String> = row.get("completed_at");
    Ok(StepRecord {
        run_id: row.get("run_id"),
        step,
        status,
        processed: row.get("processed"),
        succeeded: row.get("succeeded"),
        failed: row.get("failed"),
        error: row.get("error"),
        checkpoint,
        can_resume: row.get::<i64, _>("can_resume") != 0,
        started_at: started_raw.as_deref().map(parse_timestamp).transpose()?,
        completed_at: completed_raw.as_deref().map(parse_timestamp).transpose()?,
    })
}

impl Database {
    /// Creates a run with its declared steps, all pending, in one
    /// transaction.
    #[instrument(target = "db_query", level = "info", skip(self, steps))]
    pub async fn create_run(
        &self,
        run: &PipelineRun,
        steps: &[StepName],
    ) -> Result<(), sqlx::Error> {
        let mut transaction = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (id, mode, status, started_at, completed_at, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&run.id)
        .bind(&run.mode)
        .bind(run.status.as_str())
        .bind(run.started_at.map(|t| t.to_rfc3339()))
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .bind(&run.error)
        .execute(&mut *transaction)
        .await?;

        for (index, step) in steps.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO step_records (run_id, step, step_index, status)
                VALUES (?1, ?2, ?3, 'pending')
                "#,
            )
            .bind(&run.id)
            .bind(step.as_str())
            .bind(index as i64)
            .execute(&mut *transaction)
            .await?;
        }

        transaction.commit().await?;
        info!(target: TARGET_DB, "Created run {} with {} steps", run.id, steps.len());
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, mode, status, started_at, completed_at, error FROM pipeline_runs WHERE id = ?1",
        )
        .bind(run_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            let status_raw: String = row.get("status");
            let status = RunStatus::parse(&status_raw).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown status '{}'", status_raw).into())
            })?;
            let started_raw: Option<String> = row.get("started_at");
            let completed_raw: Option<String> = row.get("completed_at");
            Ok(PipelineRun {
                id: row.get("id"),
                mode: row.get("mode"),
                status,
                started_at: started_raw.as_deref().map(parse_timestamp).transpose()?,
                completed_at: completed_raw.as_deref().map(parse_timestamp).transpose()?,
                error: row.get("error"),
            })
        })
        .transpose()
    }

    /// Transitions a run. Running stamps started_at once; completed/failed
    /// stamp completed_at. Completed runs are never mutated again.
    pub async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        match status {
            RunStatus::Running => {
                sqlx::query(
                    r#"
                    UPDATE pipeline_runs
                    SET status = ?1, started_at = COALESCE(started_at, ?2), error = COALESCE(?3, error)
                    WHERE id = ?4
                    "#,
                )
                .bind(status.as_str())
                .bind(&now)
                .bind(error)
                .bind(run_id)
                .execute(self.pool())
                .await?;
            }
            RunStatus::Completed | RunStatus::Failed => {
                sqlx::query(
                    r#"
                    UPDATE pipeline_runs
                    SET status = ?1, completed_at = ?2, error = COALESCE(?3, error)
                    WHERE id = ?4
                    "#,
                )
                .bind(status.as_str())
                .bind(&now)
                .bind(error)
                .bind(run_id)
                .execute(self.pool())
                .await?;
            }
            RunStatus::Pending | RunStatus::Paused => {
                sqlx::query(
                    "UPDATE pipeline_runs SET status = ?1, error = COALESCE(?2, error) WHERE id = ?3",
                )
                .bind(status.as_str())
                .bind(error)
                .bind(run_id)
                .execute(self.pool())
                .await?;
            }
        }
        debug!(target: TARGET_DB, "Run {} is now {}", run_id, status.as_str());
        Ok(())
    }

    /// Step records for a run, in declared execution order.
    pub async fn step_records(&self, run_id: &str) -> Result<Vec<StepRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, step, status, processed, succeeded, failed, error,
                   checkpoint, can_resume, started_at, completed_at
            FROM step_records
            WHERE run_id = ?1
            ORDER BY step_index ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(step_from_row).collect()
    }

    pub async fn get_step(
        &self,
        run_id: &str,
        step: StepName,
    ) -> Result<Option<StepRecord>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT run_id, step, status, processed, succeeded, failed, error,
                   checkpoint, can_resume, started_at, completed_at
            FROM step_records
            WHERE run_id = ?1 AND step = ?2
            "#,
        )
        .bind(run_id)
        .bind(step.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(step_from_row).transpose()
    }

    /// Transitions a step, retaining the most recent error verbatim.
    pub async fn update_step_status(
        &self,
        run_id: &str,
        step: StepName,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        match status {
            RunStatus::Running => {
                sqlx::query(
                    r#"
                    UPDATE step_records
                    SET status = ?1, started_at = COALESCE(started_at, ?2), error = COALESCE(?3, error)
                    WHERE run_id = ?4 AND step = ?5
                    "#,
                )
                .bind(status.as_str())
                .bind(&now)
                .bind(error)
                .bind(run_id)
                .bind(step.as_str())
                .execute(self.pool())
                .await?;
            }
            RunStatus::Completed | RunStatus::Failed => {
                // A failed step is never re-entered; recovery is a new run.
                sqlx::query(
                    r#"
                    UPDATE step_records
                    SET status = ?1, completed_at = ?2, error = COALESCE(?3, error),
                        can_resume = CASE WHEN ?1 = 'failed' THEN 0 ELSE can_resume END
                    WHERE run_id = ?4 AND step = ?5
                    "#,
                )
                .bind(status.as_str())
                .bind(&now)
                .bind(error)
                .bind(run_id)
                .bind(step.as_str())
                .execute(self.pool())
                .await?;
            }
            RunStatus::Pending | RunStatus::Paused => {
                sqlx::query(
                    r#"
                    UPDATE step_records
                    SET status = ?1, error = COALESCE(?2, error)
                    WHERE run_id = ?3 AND step = ?4
                    "#,
                )
                .bind(status.as_str())
                .bind(error)
                .bind(run_id)
                .bind(step.as_str())
                .execute(self.pool())
                .await?;
            }
        }
        debug!(target: TARGET_DB, "Step {}/{} is now {}", run_id, step.as_str(), status.as_str());
        Ok(())
    }

    pub async fn update_step_progress(
        &self,
        run_id: &str,
        step: StepName,
        processed: i64,
        succeeded: i64,
        failed: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE step_records
            SET processed = ?1, succeeded = ?2, failed = ?3
            WHERE run_id = ?4 AND step = ?5
            "#,
        )
        .bind(processed)
        .bind(succeeded)
        .bind(failed)
        .bind(run_id)
        .bind(step.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Persists the set of item ids already committed by an interrupted
    /// step, so resume never reprocesses them.
    pub async fn save_step_checkpoint(
        &self,
        run_id: &str,
        step: StepName,
        committed: &[String],
    ) -> Result<(), sqlx::Error> {
        let checkpoint =
            serde_json::to_string(committed).map_err(|e| sqlx::Error::Encode(e.into()))?;
        sqlx::query("UPDATE step_records SET checkpoint = ?1 WHERE run_id = ?2 AND step = ?3")
            .bind(checkpoint)
            .bind(run_id)
            .bind(step.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Deletes runs past the retention window, together with their step
    /// records, and returns the number of runs removed. Pending and running
    /// runs are never touched.
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn cleanup_runs(&self, retention_days: i64) -> Result<u64, sqlx::Error> {
        let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();
        let mut transaction = self.pool().begin().await?;

        sqlx::query(
            r#"
            DELETE FROM step_records WHERE run_id IN (
                SELECT id FROM pipeline_runs
                WHERE status IN ('completed', 'failed', 'paused')
                  AND COALESCE(completed_at, started_at) < ?1
            )
            "#,
        )
        .bind(&cutoff)
        .execute(&mut *transaction)
        .await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM pipeline_runs
            WHERE status IN ('completed', 'failed', 'paused')
              AND COALESCE(completed_at, started_at) < ?1
            "#,
        )
        .bind(&cutoff)
        .execute(&mut *transaction)
        .await?
        .rows_affected();

        transaction.commit().await?;
        info!(target: TARGET_DB, "Cleaned up {} runs older than {} days", deleted, retention_days);
        Ok(deleted)
    }
}
