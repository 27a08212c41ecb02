use chrono::{Duration, NaiveDate, Utc};
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::core::{day_key, parse_day, parse_timestamp, Database};
use crate::models::{Decision, DeduplicationDecision};
use crate::TARGET_DB;

impl Database {
    /// Appends one decision row. The log is append-only: rows are never
    /// mutated, and deleted only by retention cleanup.
    #[instrument(target = "db_query", level = "info", skip(self, decision))]
    pub async fn record_decision(
        &self,
        decision: &DeduplicationDecision,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO dedup_decisions
                (item_id, day, decision, matched_signature_id, confidence,
                 error_flag, processing_ms, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&decision.item_id)
        .bind(day_key(decision.day))
        .bind(decision.decision.as_str())
        .bind(decision.matched_signature_id)
        .bind(decision.confidence)
        .bind(decision.error_flag as i64)
        .bind(decision.processing_ms)
        .bind(decision.created_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        debug!(
            target: TARGET_DB,
            "Recorded {} decision for {} on {}",
            decision.decision.as_str(),
            decision.item_id,
            decision.day
        );
        Ok(())
    }

    pub async fn decisions_for_day(
        &self,
        day: NaiveDate,
    ) -> Result<Vec<DeduplicationDecision>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, day, decision, matched_signature_id, confidence,
                   error_flag, processing_ms, created_at
            FROM dedup_decisions
            WHERE day = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(day_key(day))
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let day_raw: String = row.get("day");
                let created_raw: String = row.get("created_at");
                let decision_raw: String = row.get("decision");
                let decision = match decision_raw.as_str() {
                    "DUPLICATE" => Decision::Duplicate,
                    "UNIQUE" => Decision::Unique,
                    other => {
                        return Err(sqlx::Error::Decode(
                            format!("unknown decision '{}'", other).into(),
                        ))
                    }
                };
                Ok(DeduplicationDecision {
                    item_id: row.get("item_id"),
                    day: parse_day(&day_raw)?,
                    decision,
                    matched_signature_id: row.get("matched_signature_id"),
                    confidence: row.get("confidence"),
                    error_flag: row.get::<i64, _>("error_flag") != 0,
                    processing_ms: row.get("processing_ms"),
                    created_at: parse_timestamp(&created_raw)?,
                })
            })
            .collect()
    }

    /// Deletes decision rows past the retention window; returns the count.
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn cleanup_decisions(&self, retention_days: i64) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now().date_naive() - Duration::days(retention_days);
        let deleted = sqlx::query("DELETE FROM dedup_decisions WHERE day < ?1")
            .bind(day_key(cutoff))
            .execute(self.pool())
            .await?
            .rows_affected();

        info!(target: TARGET_DB, "Cleaned up {} decision rows older than {}", deleted, cutoff);
        Ok(deleted)
    }
}
