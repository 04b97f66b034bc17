use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use super::core::{Database, DbConflictErrorExt};
use crate::error::StoreError;
use crate::store::{MetaStore, RecordId};
use crate::TARGET_DB;

#[async_trait]
impl MetaStore for Database {
    #[instrument(target = "db", level = "debug", skip(self))]
    async fn get_meta(&self, id: RecordId, key: &str) -> Result<Option<Value>, StoreError> {
        let raw = sqlx::query_scalar::<_, String>(
            "SELECT meta_value FROM record_meta WHERE record_id = ?1 AND meta_key = ?2",
        )
        .bind(id)
        .bind(key)
        .fetch_optional(self.pool())
        .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    #[instrument(target = "db", level = "debug", skip(self, value))]
    async fn add_meta(&self, id: RecordId, key: &str, value: &Value) -> Result<bool, StoreError> {
        let encoded = serde_json::to_string(value)?;

        let result = sqlx::query(
            "INSERT INTO record_meta (record_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
        )
        .bind(id)
        .bind(key)
        .bind(&encoded)
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if err.is_unique_violation() => {
                debug!(target: TARGET_DB, "Meta {} already exists on record {}", key, id);
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(target = "db", level = "debug", skip(self, value))]
    async fn update_meta(
        &self,
        id: RecordId,
        key: &str,
        value: &Value,
    ) -> Result<bool, StoreError> {
        let encoded = serde_json::to_string(value)?;

        let result = sqlx::query(
            r#"
            INSERT INTO record_meta (record_id, meta_key, meta_value) VALUES (?1, ?2, ?3)
            ON CONFLICT(record_id, meta_key) DO UPDATE SET meta_value = excluded.meta_value
            WHERE record_meta.meta_value != excluded.meta_value
            "#,
        )
        .bind(id)
        .bind(key)
        .bind(&encoded)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    async fn delete_meta(&self, id: RecordId, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM record_meta WHERE record_id = ?1 AND meta_key = ?2")
            .bind(id)
            .bind(key)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    async fn all_metas(&self, id: RecordId) -> Result<BTreeMap<String, Value>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT meta_key, meta_value FROM record_meta WHERE record_id = ?1",
        )
        .bind(id)
        .fetch_all(self.pool())
        .await?;

        let mut metas = BTreeMap::new();
        for (key, raw) in rows {
            metas.insert(key, serde_json::from_str(&raw)?);
        }
        Ok(metas)
    }
}
