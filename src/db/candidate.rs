use chrono::NaiveDate;
use sqlx::Row;
use tracing::{debug, instrument};

use super::core::{day_key, parse_timestamp, Database};
use crate::models::CandidateItem;
use crate::TARGET_DB;

fn candidate_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CandidateItem, sqlx::Error> {
    let discovered_raw: String = row.get("discovered_at");
    Ok(CandidateItem {
        id: row.get("id"),
        title: row.get("title"),
        text: row.get("text"),
        content_digest: row.get("content_digest"),
        source: row.get("source"),
        authority_tier: row.get::<i64, _>("authority_tier") as u8,
        quality: row.get("quality"),
        confidence: row.get("confidence"),
        discovered_at: parse_timestamp(&discovered_raw)?,
    })
}

impl Database {
    /// Stores a batch of candidates for a run in one transaction.
    #[instrument(target = "db_query", level = "info", skip(self, items))]
    pub async fn insert_candidates(
        &self,
        run_id: &str,
        items: &[CandidateItem],
    ) -> Result<(), sqlx::Error> {
        let mut transaction = self.pool().begin().await?;
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO candidates
                    (id, run_id, title, text, content_digest, source, authority_tier,
                     quality, confidence, discovered_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&item.id)
            .bind(run_id)
            .bind(&item.title)
            .bind(&item.text)
            .bind(&item.content_digest)
            .bind(&item.source)
            .bind(item.authority_tier as i64)
            .bind(item.quality)
            .bind(item.confidence)
            .bind(item.discovered_at.to_rfc3339())
            .execute(&mut *transaction)
            .await?;
        }
        transaction.commit().await?;
        debug!(target: TARGET_DB, "Stored {} candidates for run {}", items.len(), run_id);
        Ok(())
    }

    /// Candidates for a run in insertion order.
    pub async fn candidates_for_run(
        &self,
        run_id: &str,
    ) -> Result<Vec<CandidateItem>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, text, content_digest, source, authority_tier,
                   quality, confidence, discovered_at
            FROM candidates
            WHERE run_id = ?1
            ORDER BY rowid ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(candidate_from_row).collect()
    }

    /// Candidates discovered on `day` that have no dedup decision yet and
    /// were not already excluded as same-batch duplicates.
    pub async fn candidates_pending_dedup(
        &self,
        day: NaiveDate,
    ) -> Result<Vec<CandidateItem>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, text, content_digest, source, authority_tier,
                   quality, confidence, discovered_at
            FROM candidates c
            WHERE date(c.discovered_at) = ?1
              AND c.duplicate_of IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM dedup_decisions d
                  WHERE d.item_id = c.id AND d.day = ?1
              )
            ORDER BY rowid ASC
            "#,
        )
        .bind(day_key(day))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(candidate_from_row).collect()
    }

    pub async fn set_selection_rank(
        &self,
        item_id: &str,
        rank: u32,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE candidates SET selection_rank = ?1 WHERE id = ?2")
            .bind(rank as i64)
            .bind(item_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Excludes an item from active work by recording what superseded it:
    /// a same-batch cluster primary or a cross-run signature source.
    pub async fn mark_duplicate(
        &self,
        item_id: &str,
        duplicate_of: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE candidates SET duplicate_of = ?1 WHERE id = ?2")
            .bind(duplicate_of)
            .bind(item_id)
            .execute(self.pool())
            .await?;
        debug!(target: TARGET_DB, "Marked {} as duplicate of {}", item_id, duplicate_of);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candidate(id: &str) -> CandidateItem {
        CandidateItem {
            id: id.to_string(),
            title: format!("title {}", id),
            text: format!("body {}", id),
            content_digest: CandidateItem::compute_digest(id),
            source: "example.com".to_string(),
            authority_tier: 2,
            quality: 0.6,
            confidence: 0.8,
            discovered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_preserves_order_and_fields() {
        let db = Database::new_in_memory().await.unwrap();
        let items = vec![candidate("a"), candidate("b"), candidate("c")];
        db.insert_candidates("run-1", &items).await.unwrap();

        let fetched = db.candidates_for_run("run-1").await.unwrap();
        assert_eq!(fetched.len(), 3);
        assert_eq!(fetched[0].id, "a");
        assert_eq!(fetched[2].id, "c");
        assert_eq!(fetched[0].authority_tier, 2);
        assert_eq!(fetched[0].content_digest, items[0].content_digest);
    }

    #[tokio::test]
    async fn pending_dedup_excludes_marked_duplicates() {
        let db = Database::new_in_memory().await.unwrap();
        let items = vec![candidate("a"), candidate("b")];
        db.insert_candidates("run-1", &items).await.unwrap();
        db.mark_duplicate("b", "a").await.unwrap();

        let day = Utc::now().date_naive();
        let pending = db.candidates_pending_dedup(day).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "a");
    }
}
