use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite,
};
use std::str::FromStr;
use tokio::time::Duration;
use tracing::{info, instrument};

use crate::TARGET_DB;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Get access to the database pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

// Helper method to check if an sqlx error is a uniqueness violation
pub trait DbConflictErrorExt {
    fn is_unique_violation(&self) -> bool;
}

impl DbConflictErrorExt for sqlx::Error {
    fn is_unique_violation(&self) -> bool {
        match self {
            sqlx::Error::Database(err) => {
                err.is_unique_violation() || err.message().contains("UNIQUE constraint failed")
            }
            _ => false,
        }
    }
}

impl Database {
    #[instrument(target = "db", level = "info")]
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        info!(target: TARGET_DB, "Creating database pool for: {}", database_url);

        let connect_options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", database_url))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5))
                .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        info!(target: TARGET_DB, "Database pool created");

        // Initialize schema
        let db = Database { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// A private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to :memory: is a separate database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await?;

        let db = Database { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// Collect row counts from the main tables, formatted as `feeds:items:metas:options`.
    pub async fn collect_stats(&self) -> Result<String, sqlx::Error> {
        let queries = vec![
            "SELECT COUNT(*) FROM records WHERE kind = 'pf_feed';",
            "SELECT COUNT(*) FROM records WHERE kind = 'pf_feed_item';",
            "SELECT COUNT(*) FROM record_meta;",
            "SELECT COUNT(*) FROM options;",
        ];

        let mut results = vec![];
        for query in queries {
            let count: i64 = sqlx::query_scalar(query).fetch_one(&self.pool).await?;
            results.push(count);
        }

        Ok(results
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(":"))
    }
}
