use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candidates (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                title TEXT NOT NULL,
                text TEXT NOT NULL,
                content_digest TEXT NOT NULL,
                source TEXT NOT NULL,
                authority_tier INTEGER NOT NULL,
                quality REAL NOT NULL,
                confidence REAL NOT NULL,
                discovered_at TEXT NOT NULL,
                selection_rank INTEGER,
                duplicate_of TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_candidates_run_id ON candidates (run_id);
            CREATE INDEX IF NOT EXISTS idx_candidates_digest ON candidates (content_digest);
            CREATE INDEX IF NOT EXISTS idx_candidates_discovered_at ON candidates (discovered_at);

            CREATE TABLE IF NOT EXISTS duplicate_clusters (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                member_ids TEXT NOT NULL,
                primary_id TEXT NOT NULL,
                method TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_clusters_run_id ON duplicate_clusters (run_id);

            CREATE TABLE IF NOT EXISTS topic_signatures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                day TEXT NOT NULL,
                run_sequence INTEGER NOT NULL,
                theme TEXT NOT NULL,
                excerpt TEXT NOT NULL,
                source_item_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (day, source_item_id)
            );
            CREATE INDEX IF NOT EXISTS idx_signatures_day ON topic_signatures (day, run_sequence);

            CREATE TABLE IF NOT EXISTS dedup_decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id TEXT NOT NULL,
                day TEXT NOT NULL,
                decision TEXT NOT NULL,
                matched_signature_id INTEGER,
                confidence REAL NOT NULL,
                error_flag INTEGER NOT NULL DEFAULT 0,
                processing_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_day ON dedup_decisions (day);
            CREATE INDEX IF NOT EXISTS idx_decisions_item ON dedup_decisions (item_id, day);

            CREATE TABLE IF NOT EXISTS pipeline_runs (
                id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON pipeline_runs (status);

            CREATE TABLE IF NOT EXISTS step_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                step TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                status TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                checkpoint TEXT NOT NULL DEFAULT '[]',
                can_resume INTEGER NOT NULL DEFAULT 1,
                started_at TEXT,
                completed_at TEXT,
                UNIQUE (run_id, step)
            );
            CREATE INDEX IF NOT EXISTS idx_steps_run_id ON step_records (run_id, step_index);
            "#,
        )
        .execute(&mut *conn)
        .await?;
        info!(target: TARGET_DB, "Tables ensured to exist");

        Ok(())
    }
}
