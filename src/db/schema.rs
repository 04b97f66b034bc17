use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS options (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,         -- pf_feed, pf_feed_item, nomination, post
                status TEXT NOT NULL,       -- publish, draft, ...
                title TEXT NOT NULL DEFAULT '',
                guid TEXT NOT NULL DEFAULT '',
                parent_id INTEGER,
                owner TEXT,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_kind_status ON records (kind, status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_records_item_guid
                ON records (parent_id, guid) WHERE kind = 'pf_feed_item';

            CREATE TABLE IF NOT EXISTS record_meta (
                record_id INTEGER NOT NULL,
                meta_key TEXT NOT NULL,
                meta_value TEXT NOT NULL,
                UNIQUE (record_id, meta_key)
            );
            CREATE INDEX IF NOT EXISTS idx_record_meta_key ON record_meta (meta_key);

            CREATE TABLE IF NOT EXISTS record_terms (
                record_id INTEGER NOT NULL,
                taxonomy TEXT NOT NULL,
                term TEXT NOT NULL,
                UNIQUE (record_id, taxonomy, term)
            );
            "#,
        )
        .execute(&mut *conn)
        .await?;

        info!(target: TARGET_DB, "Database schema initialized");
        Ok(())
    }
}
