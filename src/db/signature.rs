use chrono::{Duration, NaiveDate, Utc};
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::core::{day_key, parse_day, parse_timestamp, Database};
use crate::models::TopicSignature;
use crate::TARGET_DB;

fn signature_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TopicSignature, sqlx::Error> {
    let day_raw: String = row.get("day");
    let created_raw: String = row.get("created_at");
    Ok(TopicSignature {
        id: row.get("id"),
        day: parse_day(&day_raw)?,
        run_sequence: row.get("run_sequence"),
        theme: row.get("theme"),
        excerpt: row.get("excerpt"),
        source_item_id: row.get("source_item_id"),
        created_at: parse_timestamp(&created_raw)?,
    })
}

impl Database {
    /// Stores one topic signature and returns its id. Signatures are unique
    /// per (day, source item); re-storing the same pair returns the existing
    /// id instead of creating an orphan.
    #[instrument(target = "db_query", level = "info", skip(self, theme, excerpt))]
    pub async fn store_signature(
        &self,
        day: NaiveDate,
        run_sequence: i64,
        theme: &str,
        excerpt: &str,
        source_item_id: &str,
    ) -> Result<i64, sqlx::Error> {
        let mut transaction = self.pool().begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO topic_signatures (day, run_sequence, theme, excerpt, source_item_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(day, source_item_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(day_key(day))
        .bind(run_sequence)
        .bind(theme)
        .bind(excerpt)
        .bind(source_item_id)
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&mut *transaction)
        .await?;

        let id = match inserted {
            Some(row) => row.get("id"),
            None => {
                sqlx::query_scalar(
                    "SELECT id FROM topic_signatures WHERE day = ?1 AND source_item_id = ?2",
                )
                .bind(day_key(day))
                .bind(source_item_id)
                .fetch_one(&mut *transaction)
                .await?
            }
        };

        transaction.commit().await?;
        debug!(target: TARGET_DB, "Stored signature {} for item {} on {}", id, source_item_id, day);
        Ok(id)
    }

    /// All signatures for a day, ordered by run sequence then insertion
    /// order. An empty day yields an empty list, never an error.
    pub async fn signatures_for_day(
        &self,
        day: NaiveDate,
    ) -> Result<Vec<TopicSignature>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, day, run_sequence, theme, excerpt, source_item_id, created_at
            FROM topic_signatures
            WHERE day = ?1
            ORDER BY run_sequence ASC, id ASC
            "#,
        )
        .bind(day_key(day))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(signature_from_row).collect()
    }

    /// Highest run sequence stored for a day; 0 when the day is empty.
    pub async fn max_run_sequence(&self, day: NaiveDate) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COALESCE(MAX(run_sequence), 0) FROM topic_signatures WHERE day = ?1",
        )
        .bind(day_key(day))
        .fetch_one(self.pool())
        .await
    }

    /// Deletes signatures older than the retention window and returns the
    /// exact count deleted. Same-day reset is structural: signatures are
    /// keyed by day, so nothing here runs at midnight.
    #[instrument(target = "db_query", level = "info", skip(self))]
    pub async fn cleanup_signatures(&self, retention_days: i64) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now().date_naive() - Duration::days(retention_days);
        let deleted = sqlx::query("DELETE FROM topic_signatures WHERE day < ?1")
            .bind(day_key(cutoff))
            .execute(self.pool())
            .await?
            .rows_affected();

        info!(target: TARGET_DB, "Cleaned up {} signatures older than {}", deleted, cutoff);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_empty_list_for_unknown_day() {
        let db = Database::new_in_memory().await.unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 8, 23).unwrap();
        assert!(db.signatures_for_day(day).await.unwrap().is_empty());
        assert_eq!(db.max_run_sequence(day).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn signatures_are_ordered_by_sequence_then_insertion() {
        let db = Database::new_in_memory().await.unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 8, 23).unwrap();

        db.store_signature(day, 2, "later", "e", "item-3").await.unwrap();
        db.store_signature(day, 1, "first", "e", "item-1").await.unwrap();
        db.store_signature(day, 1, "second", "e", "item-2").await.unwrap();

        let signatures = db.signatures_for_day(day).await.unwrap();
        let order: Vec<&str> = signatures.iter().map(|s| s.theme.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "later"]);
        assert_eq!(db.max_run_sequence(day).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_store_returns_existing_id() {
        let db = Database::new_in_memory().await.unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 8, 23).unwrap();

        let first = db.store_signature(day, 1, "theme", "e", "item-1").await.unwrap();
        let second = db.store_signature(day, 2, "theme again", "e", "item-1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(db.signatures_for_day(day).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_item_on_different_days_is_distinct() {
        let db = Database::new_in_memory().await.unwrap();
        let monday = NaiveDate::from_ymd_opt(2026, 8, 24).unwrap();
        let tuesday = NaiveDate::from_ymd_opt(2026, 8, 25).unwrap();

        let a = db.store_signature(monday, 1, "t", "e", "item-1").await.unwrap();
        let b = db.store_signature(tuesday, 1, "t", "e", "item-1").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn cleanup_deletes_only_outside_the_window() {
        let db = Database::new_in_memory().await.unwrap();
        let today = Utc::now().date_naive();
        let old = today - Duration::days(10);
        let recent = today - Duration::days(3);

        db.store_signature(old, 1, "old-1", "e", "a").await.unwrap();
        db.store_signature(old, 1, "old-2", "e", "b").await.unwrap();
        db.store_signature(recent, 1, "recent", "e", "c").await.unwrap();
        db.store_signature(today, 1, "today", "e", "d").await.unwrap();

        let deleted = db.cleanup_signatures(7).await.unwrap();
        assert_eq!(deleted, 2);

        assert_eq!(db.signatures_for_day(recent).await.unwrap().len(), 1);
        assert_eq!(db.signatures_for_day(today).await.unwrap().len(), 1);
        assert!(db.signatures_for_day(old).await.unwrap().is_empty());
    }
}
