use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use super::core::Database;
use crate::error::StoreError;
use crate::store::OptionStore;
use crate::TARGET_DB;

#[async_trait]
impl OptionStore for Database {
    #[instrument(target = "db", level = "debug", skip(self))]
    async fn get_option(&self, name: &str) -> Result<Option<Value>, StoreError> {
        let raw = sqlx::query_scalar::<_, String>("SELECT value FROM options WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.pool())
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    #[instrument(target = "db", level = "debug", skip(self, value))]
    async fn update_option(&self, name: &str, value: &Value) -> Result<bool, StoreError> {
        let encoded = serde_json::to_string(value)?;

        let existing = sqlx::query_scalar::<_, String>("SELECT value FROM options WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.pool())
            .await?;

        if existing.as_deref() == Some(encoded.as_str()) {
            debug!(target: TARGET_DB, "Option {} already holds this value", name);
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO options (name, value) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(name)
        .bind(&encoded)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    async fn delete_option(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM options WHERE name = ?1")
            .bind(name)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_update_option_reports_unchanged_values() {
        let db = Database::in_memory().await.unwrap();

        assert_eq!(db.get_option("pf_feeds_iteration").await.unwrap(), None);
        assert!(db.update_option("pf_feeds_iteration", &json!(3)).await.unwrap());
        assert!(!db.update_option("pf_feeds_iteration", &json!(3)).await.unwrap());
        assert!(db.update_option("pf_feeds_iteration", &json!(4)).await.unwrap());
        assert_eq!(
            db.get_option("pf_feeds_iteration").await.unwrap(),
            Some(json!(4))
        );

        assert!(db.delete_option("pf_feeds_iteration").await.unwrap());
        assert!(!db.delete_option("pf_feeds_iteration").await.unwrap());
        assert_eq!(db.get_option("pf_feeds_iteration").await.unwrap(), None);
    }
}
