use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::metas::{fields, MetaAccess};
use crate::store::{is_empty_value, NewRecord, Record, RecordId, RecordKind, STATUS_PUBLISH};
use crate::TARGET_RETRIEVAL;

/// Feed kind assumed when a feed has none recorded.
pub const DEFAULT_FEED_KIND: &str = "rss";

/// A feed record together with the metadata retrieval needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Feed {
    pub id: RecordId,
    pub title: String,
    pub status: String,
    pub kind: String,
    pub url: String,
    pub html_url: Option<String>,
    pub default_author: Option<String>,
    pub error_count: u64,
    pub last_retrieved: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct NewFeed {
    pub url: String,
    pub title: String,
    pub kind: Option<String>,
    pub html_url: Option<String>,
    pub default_author: Option<String>,
    pub user_added: Option<String>,
    pub module_added: Option<String>,
}

pub async fn load_feed(access: &MetaAccess, record: Record) -> Result<Feed, StoreError> {
    let id = record.id;
    let kind = text(access.read(id, fields::FEED_TYPE).await?)
        .unwrap_or_else(|| DEFAULT_FEED_KIND.to_string());
    let url = text(access.read(id, fields::FEED_URL).await?).unwrap_or_else(|| record.guid.clone());
    let error_count = access
        .read(id, fields::FEED_ERROR_COUNT)
        .await?
        .as_ref()
        .and_then(as_count)
        .unwrap_or(0);

    Ok(Feed {
        id,
        title: record.title,
        status: record.status,
        kind,
        url,
        html_url: text(access.read(id, fields::HTML_URL).await?),
        default_author: text(access.read(id, fields::FEED_DEFAULT_AUTHOR).await?),
        error_count,
        last_retrieved: text(access.read(id, fields::FEED_LAST_RETRIEVED).await?),
    })
}

pub async fn load_feed_by_id(access: &MetaAccess, id: RecordId) -> Result<Feed, StoreError> {
    let record = access
        .ports()
        .records
        .get_record(id)
        .await?
        .filter(|r| r.kind == RecordKind::Feed)
        .ok_or_else(|| StoreError::NotFound(format!("feed {}", id)))?;
    load_feed(access, record).await
}

/// Ordered snapshot of every published feed, minus the excluded kinds.
pub async fn feed_list(access: &MetaAccess, excluded_kinds: &[String]) -> Result<Vec<Feed>, StoreError> {
    let records = access.ports().records.published_feeds().await?;
    let mut feeds = Vec::with_capacity(records.len());
    for record in records {
        let feed = load_feed(access, record).await?;
        if excluded_kinds.iter().any(|k| k == &feed.kind) {
            debug!(target: TARGET_RETRIEVAL, "Leaving {} feed {} out of the feed list", feed.kind, feed.id);
            continue;
        }
        feeds.push(feed);
    }
    Ok(feeds)
}

/// Creates a published feed, or returns the existing one with the same URL.
pub async fn add_feed(access: &MetaAccess, new: NewFeed) -> Result<RecordId, StoreError> {
    let records = &access.ports().records;
    if let Some(existing) = records
        .published_feeds()
        .await?
        .into_iter()
        .find(|r| r.guid == new.url)
    {
        debug!(target: TARGET_RETRIEVAL, "Feed {} already exists as {}", new.url, existing.id);
        return Ok(existing.id);
    }

    let title = if new.title.trim().is_empty() {
        new.url.clone()
    } else {
        new.title.trim().to_string()
    };
    let id = records
        .insert_record(&NewRecord {
            kind: RecordKind::Feed,
            status: STATUS_PUBLISH.to_string(),
            title,
            guid: new.url.clone(),
            parent_id: None,
            owner: new.user_added.clone(),
        })
        .await?;

    let mut entries = vec![
        (fields::FEED_URL, json!(&new.url)),
        (fields::FEED_TYPE, json!(new.kind.unwrap_or_else(|| DEFAULT_FEED_KIND.to_string()))),
    ];
    let optional = [
        (fields::HTML_URL, new.html_url),
        (fields::FEED_DEFAULT_AUTHOR, new.default_author),
        (fields::USER_ADDED, new.user_added),
        (fields::MODULE_ADDED, new.module_added),
    ];
    for (field, value) in optional {
        if let Some(value) = value {
            entries.push((field, json!(value)));
        }
    }
    access.establish(id, entries).await?;

    info!(target: TARGET_RETRIEVAL, "Added feed {} ({})", id, new.url);
    Ok(id)
}

fn text(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(other) if !is_empty_value(Some(&other)) && !other.is_string() => Some(other.to_string()),
        _ => None,
    }
}

pub(crate) fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
