use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, instrument};

use super::core::{Database, DbConflictErrorExt};
use crate::error::StoreError;
use crate::store::{NewRecord, Record, RecordId, RecordKind, RecordStore, STATUS_PUBLISH};
use crate::TARGET_DB;

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Record, StoreError> {
    let kind: String = row.try_get("kind")?;
    let kind = RecordKind::parse(&kind)
        .ok_or_else(|| StoreError::NotFound(format!("unknown record kind {}", kind)))?;
    let created_at: String = row.try_get("created_at")?;
    let modified_at: String = row.try_get("modified_at")?;

    Ok(Record {
        id: row.try_get("id")?,
        kind,
        status: row.try_get("status")?,
        title: row.try_get("title")?,
        guid: row.try_get("guid")?,
        parent_id: row.try_get("parent_id")?,
        owner: row.try_get("owner")?,
        created_at: parse_timestamp(&created_at),
        modified_at: parse_timestamp(&modified_at),
    })
}

#[async_trait]
impl RecordStore for Database {
    #[instrument(target = "db", level = "debug", skip(self))]
    async fn get_record(&self, id: RecordId) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query("SELECT * FROM records WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    async fn published_feeds(&self) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query("SELECT * FROM records WHERE kind = ?1 AND status = ?2 ORDER BY id")
            .bind(RecordKind::Feed.as_str())
            .bind(STATUS_PUBLISH)
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(target = "db", level = "debug", skip(self, record))]
    async fn insert_record(&self, record: &NewRecord) -> Result<RecordId, StoreError> {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT INTO records (kind, status, title, guid, parent_id, owner, created_at, modified_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            "#,
        )
        .bind(record.kind.as_str())
        .bind(&record.status)
        .bind(&record.title)
        .bind(&record.guid)
        .bind(record.parent_id)
        .bind(&record.owner)
        .bind(&now)
        .execute(self.pool())
        .await;

        let result = match result {
            Ok(result) => result,
            Err(err) if err.is_unique_violation() => {
                debug!(target: TARGET_DB, "{} record {} already exists", record.kind, record.guid);
                return Err(StoreError::Duplicate(record.guid.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        let id = result.last_insert_rowid();
        debug!(target: TARGET_DB, "Inserted {} record {} ({})", record.kind, id, record.guid);
        Ok(id)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    async fn find_item(
        &self,
        parent_id: RecordId,
        guid: &str,
    ) -> Result<Option<RecordId>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM records WHERE kind = ?1 AND parent_id = ?2 AND guid = ?3 LIMIT 1",
        )
        .bind(RecordKind::Item.as_str())
        .bind(parent_id)
        .bind(guid)
        .fetch_optional(self.pool())
        .await?;

        Ok(id)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    async fn set_status(&self, id: RecordId, status: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE records SET status = ?1, modified_at = ?2 WHERE id = ?3 AND status != ?1",
        )
        .bind(status)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::STATUS_DRAFT;

    fn feed(guid: &str, status: &str) -> NewRecord {
        NewRecord {
            kind: RecordKind::Feed,
            status: status.to_string(),
            title: format!("Feed {}", guid),
            guid: guid.to_string(),
            parent_id: None,
            owner: Some("admin".to_string()),
        }
    }

    #[tokio::test]
    async fn test_published_feeds_are_ordered_and_filtered() {
        let db = Database::in_memory().await.unwrap();

        let a = db.insert_record(&feed("https://a.example/feed", STATUS_PUBLISH)).await.unwrap();
        let _ = db.insert_record(&feed("https://b.example/feed", STATUS_DRAFT)).await.unwrap();
        let c = db.insert_record(&feed("https://c.example/feed", STATUS_PUBLISH)).await.unwrap();

        let feeds = db.published_feeds().await.unwrap();
        let ids: Vec<_> = feeds.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![a, c]);
        assert!(feeds.iter().all(|f| f.kind == RecordKind::Feed));

        assert!(db.set_status(a, STATUS_DRAFT).await.unwrap());
        assert!(!db.set_status(a, STATUS_DRAFT).await.unwrap());
        assert_eq!(db.published_feeds().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_item_by_parent_and_guid() {
        let db = Database::in_memory().await.unwrap();
        let parent = db.insert_record(&feed("https://a.example/feed", STATUS_PUBLISH)).await.unwrap();

        let item = NewRecord {
            kind: RecordKind::Item,
            status: STATUS_PUBLISH.to_string(),
            title: "Hello".to_string(),
            guid: "urn:item:1".to_string(),
            parent_id: Some(parent),
            owner: None,
        };
        let id = db.insert_record(&item).await.unwrap();

        assert_eq!(db.find_item(parent, "urn:item:1").await.unwrap(), Some(id));
        assert_eq!(db.find_item(parent, "urn:item:2").await.unwrap(), None);
        assert_eq!(db.find_item(parent + 1, "urn:item:1").await.unwrap(), None);

        let stored = db.get_record(id).await.unwrap().unwrap();
        assert_eq!(stored.parent_id, Some(parent));
        assert_eq!(stored.kind, RecordKind::Item);
    }
}
