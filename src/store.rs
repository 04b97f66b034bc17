//! Storage ports.
//!
//! The retrieval core never talks to a concrete database. It reads and writes
//! through these traits, which `crate::db::Database` implements on SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::StoreError;

pub type RecordId = i64;

pub const STATUS_PUBLISH: &str = "publish";
pub const STATUS_DRAFT: &str = "draft";

pub const TAXONOMY_CATEGORY: &str = "category";
pub const TAXONOMY_POST_TAG: &str = "post_tag";
pub const TAXONOMY_FEED_CATEGORY: &str = "pf_feed_category";

/// The kind of persisted document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Feed,
    Item,
    Nomination,
    Post,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Feed => "pf_feed",
            RecordKind::Item => "pf_feed_item",
            RecordKind::Nomination => "nomination",
            RecordKind::Post => "post",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "pf_feed" | "feed" => Some(RecordKind::Feed),
            "pf_feed_item" | "item" => Some(RecordKind::Item),
            "nomination" => Some(RecordKind::Nomination),
            "post" => Some(RecordKind::Post),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Record {
    pub id: RecordId,
    pub kind: RecordKind,
    pub status: String,
    pub title: String,
    pub guid: String,
    pub parent_id: Option<RecordId>,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewRecord {
    pub kind: RecordKind,
    pub status: String,
    pub title: String,
    pub guid: String,
    pub parent_id: Option<RecordId>,
    pub owner: Option<String>,
}

/// Individually named, individually persisted settings.
#[async_trait]
pub trait OptionStore: Send + Sync {
    async fn get_option(&self, name: &str) -> Result<Option<Value>, StoreError>;

    /// Writes an option. Returns `false` when nothing changed, including when the
    /// stored value was already identical.
    async fn update_option(&self, name: &str, value: &Value) -> Result<bool, StoreError>;

    async fn delete_option(&self, name: &str) -> Result<bool, StoreError>;
}

/// Per-record key/value metadata.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get_meta(&self, id: RecordId, key: &str) -> Result<Option<Value>, StoreError>;

    /// Inserts a meta entry. Returns `false` when the key already exists.
    async fn add_meta(&self, id: RecordId, key: &str, value: &Value) -> Result<bool, StoreError>;

    /// Inserts or overwrites a meta entry. Returns `false` when nothing changed.
    async fn update_meta(&self, id: RecordId, key: &str, value: &Value)
        -> Result<bool, StoreError>;

    async fn delete_meta(&self, id: RecordId, key: &str) -> Result<bool, StoreError>;

    async fn all_metas(&self, id: RecordId) -> Result<BTreeMap<String, Value>, StoreError>;
}

/// Feed, item, nomination and post documents.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, id: RecordId) -> Result<Option<Record>, StoreError>;

    /// Every published feed, in a stable order.
    async fn published_feeds(&self) -> Result<Vec<Record>, StoreError>;

    async fn insert_record(&self, record: &NewRecord) -> Result<RecordId, StoreError>;

    async fn find_item(&self, parent_id: RecordId, guid: &str)
        -> Result<Option<RecordId>, StoreError>;

    async fn set_status(&self, id: RecordId, status: &str) -> Result<bool, StoreError>;
}

/// Taxonomy assignments, used when curation copies an item forward.
#[async_trait]
pub trait TermStore: Send + Sync {
    /// All `(taxonomy, term)` pairs assigned to any of `ids`.
    async fn terms_for(&self, ids: &[RecordId]) -> Result<Vec<(String, String)>, StoreError>;

    async fn assign_term(&self, id: RecordId, taxonomy: &str, term: &str)
        -> Result<bool, StoreError>;
}

/// Convenience bound for a single backend that implements every port.
pub trait Storage: OptionStore + MetaStore + RecordStore + TermStore {}

impl<T: OptionStore + MetaStore + RecordStore + TermStore> Storage for T {}

/// Handles to each port. Usually all four point at one backend.
#[derive(Clone)]
pub struct Ports {
    pub options: Arc<dyn OptionStore>,
    pub metas: Arc<dyn MetaStore>,
    pub records: Arc<dyn RecordStore>,
    pub terms: Arc<dyn TermStore>,
}

impl Ports {
    pub fn from_backend<T: Storage + 'static>(backend: Arc<T>) -> Self {
        Self {
            options: backend.clone(),
            metas: backend.clone(),
            records: backend.clone(),
            terms: backend,
        }
    }
}

/// Whether a stored value counts as "empty" for fallback and migration purposes.
///
/// Mirrors the loose emptiness check applied to metadata: null, `false`, `0`,
/// `""`, `"0"`, empty arrays and empty objects are all empty.
pub fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64().map_or(false, |f| f == 0.0),
        Some(Value::String(s)) => s.is_empty() || s == "0",
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_empty_value() {
        assert!(is_empty_value(None));
        assert!(is_empty_value(Some(&Value::Null)));
        assert!(is_empty_value(Some(&json!(""))));
        assert!(is_empty_value(Some(&json!("0"))));
        assert!(is_empty_value(Some(&json!(0))));
        assert!(is_empty_value(Some(&json!(false))));
        assert!(is_empty_value(Some(&json!([]))));
        assert!(is_empty_value(Some(&json!({}))));

        assert!(!is_empty_value(Some(&json!("aggregation"))));
        assert!(!is_empty_value(Some(&json!(12))));
        assert!(!is_empty_value(Some(&json!(["a"]))));
    }

    #[test]
    fn test_record_kind_round_trip() {
        for kind in [
            RecordKind::Feed,
            RecordKind::Item,
            RecordKind::Nomination,
            RecordKind::Post,
        ] {
            assert_eq!(RecordKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RecordKind::parse("feed"), Some(RecordKind::Feed));
        assert_eq!(RecordKind::parse("page"), None);
    }
}
