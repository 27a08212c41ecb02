use sqlx::Row;
use tracing::{debug, instrument};

use super::core::{parse_timestamp, Database};
use crate::models::{DuplicateCluster, SimilarityMethod};
use crate::TARGET_DB;

impl Database {
    /// Persists the clusters produced by one same-batch clustering pass,
    /// all in a single transaction.
    #[instrument(target = "db_query", level = "info", skip(self, clusters))]
    pub async fn insert_clusters(
        &self,
        run_id: &str,
        clusters: &[DuplicateCluster],
    ) -> Result<(), sqlx::Error> {
        let mut transaction = self.pool().begin().await?;
        for cluster in clusters {
            let member_json = serde_json::to_string(&cluster.member_ids)
                .map_err(|e| sqlx::Error::Encode(e.into()))?;
            sqlx::query(
                r#"
                INSERT INTO duplicate_clusters (id, run_id, member_ids, primary_id, method, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&cluster.id)
            .bind(run_id)
            .bind(member_json)
            .bind(&cluster.primary_id)
            .bind(cluster.method.as_str())
            .bind(cluster.created_at.to_rfc3339())
            .execute(&mut *transaction)
            .await?;
        }
        transaction.commit().await?;
        debug!(target: TARGET_DB, "Stored {} clusters for run {}", clusters.len(), run_id);
        Ok(())
    }

    pub async fn clusters_for_run(
        &self,
        run_id: &str,
    ) -> Result<Vec<DuplicateCluster>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, member_ids, primary_id, method, created_at
            FROM duplicate_clusters
            WHERE run_id = ?1
            ORDER BY rowid ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let member_json: String = row.get("member_ids");
                let method_raw: String = row.get("method");
                let created_raw: String = row.get("created_at");
                let member_ids: Vec<String> = serde_json::from_str(&member_json)
                    .map_err(|e| sqlx::Error::Decode(e.into()))?;
                let method = SimilarityMethod::parse(&method_raw).ok_or_else(|| {
                    sqlx::Error::Decode(format!("unknown method '{}'", method_raw).into())
                })?;
                Ok(DuplicateCluster {
                    id: row.get("id"),
                    member_ids,
                    primary_id: row.get("primary_id"),
                    method,
                    created_at: parse_timestamp(&created_raw)?,
                })
            })
            .collect()
    }
}
