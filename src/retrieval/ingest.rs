//! Turns fetched payloads into item records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use unicode_segmentation::UnicodeSegmentation;
use urlnorm::UrlNormalizer;

use super::feeds::{as_count, Feed};
use super::module::FeedItemPayload;
use crate::error::StoreError;
use crate::metas::{fields, MetaAccess};
use crate::store::{NewRecord, RecordId, RecordKind, STATUS_PUBLISH};
use crate::TARGET_RETRIEVAL;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub new_items: usize,
    pub repeats: usize,
}

/// Stores each payload under its feed. Items already seen under the same guid
/// only have their `source_repeat` count raised.
#[instrument(target = "db", level = "debug", skip(access, items))]
pub async fn ingest_items(
    access: &MetaAccess,
    feed: &Feed,
    items: Vec<FeedItemPayload>,
    now: DateTime<Utc>,
) -> Result<IngestOutcome, StoreError> {
    let records = &access.ports().records;
    let mut outcome = IngestOutcome::default();

    for item in items {
        let link = item.link.trim().to_string();
        let guid = item
            .guid
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .or_else(|| normalize_link(&link));
        let Some(guid) = guid else {
            debug!(target: TARGET_RETRIEVAL, "Skipping item without guid or link from feed {}", feed.id);
            continue;
        };

        if let Some(existing) = records.find_item(feed.id, &guid).await? {
            count_repeat(access, existing).await?;
            outcome.repeats += 1;
            continue;
        }

        let title = if item.title.trim().is_empty() {
            link.clone()
        } else {
            item.title.trim().to_string()
        };
        let inserted = records
            .insert_record(&NewRecord {
                kind: RecordKind::Item,
                status: STATUS_PUBLISH.to_string(),
                title: title.clone(),
                guid: guid.clone(),
                parent_id: Some(feed.id),
                owner: None,
            })
            .await;
        let id = match inserted {
            Ok(id) => id,
            Err(StoreError::Duplicate(_)) => {
                debug!(target: TARGET_RETRIEVAL, "Item {} of feed {} was stored concurrently", guid, feed.id);
                let existing = records
                    .find_item(feed.id, &guid)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("item {}", guid)))?;
                count_repeat(access, existing).await?;
                outcome.repeats += 1;
                continue;
            }
            Err(err) => return Err(err),
        };

        let published = item.published.unwrap_or(now);
        let authors = item
            .authors
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        let source_link = feed.html_url.clone().unwrap_or_else(|| feed.url.clone());

        access
            .establish(
                id,
                vec![
                    (fields::ITEM_ID, json!(item_hash(&title, &link))),
                    (fields::SOURCE_TITLE, json!(feed.title)),
                    (fields::SOURCE_LINK, json!(source_link)),
                    (fields::ITEM_DATE, json!(published.to_rfc3339())),
                    (fields::SORTABLE_ITEM_DATE, json!(published.timestamp())),
                    (fields::ITEM_AUTHOR, json!(authors)),
                    (fields::ITEM_LINK, json!(link)),
                    (fields::ITEM_FEAT_IMG, json!(item.featured_image.unwrap_or_default())),
                    (fields::ITEM_WP_DATE, json!(now.to_rfc3339())),
                    (fields::ITEM_TAGS, json!(item.tags.join(", "))),
                    (fields::FEED_ITEM_WORD_COUNT, json!(word_count(&item.content))),
                    (fields::REVERTIBLE_FEED_TEXT, json!(item.content)),
                    (fields::NOMINATION_COUNT, json!(0)),
                ],
            )
            .await?;

        outcome.new_items += 1;
    }

    Ok(outcome)
}

async fn count_repeat(access: &MetaAccess, item: RecordId) -> Result<(), StoreError> {
    let seen = access
        .read(item, fields::SOURCE_REPEAT)
        .await?
        .as_ref()
        .and_then(as_count)
        .unwrap_or(0);
    access.write(item, fields::SOURCE_REPEAT, json!(seen + 1)).await?;
    Ok(())
}

/// Stable item id: SHA-256 of title and link.
pub fn item_hash(title: &str, link: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(link.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn normalize_link(link: &str) -> Option<String> {
    let parsed = url::Url::parse(link).ok()?;
    Some(UrlNormalizer::default().compute_normalization_string(&parsed))
}

/// Words in the text content, ignoring markup.
pub fn word_count(content: &str) -> usize {
    let mut text = String::with_capacity(content.len());
    let mut in_tag = false;
    for c in content.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    text.unicode_words().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::retrieval::feeds::{add_feed, load_feed_by_id, NewFeed};
    use crate::store::{MetaStore, Ports};
    use std::sync::Arc;

    async fn setup() -> (Arc<Database>, MetaAccess, Feed) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let access = MetaAccess::new(Ports::from_backend(db.clone()));
        let id = add_feed(
            &access,
            NewFeed {
                url: "https://example.com/feed.xml".to_string(),
                title: "Example".to_string(),
                html_url: Some("https://example.com".to_string()),
                ..NewFeed::default()
            },
        )
        .await
        .unwrap();
        let feed = load_feed_by_id(&access, id).await.unwrap();
        (db, access, feed)
    }

    fn payload(feed: &Feed, guid: Option<&str>, link: &str) -> FeedItemPayload {
        FeedItemPayload {
            guid: guid.map(str::to_string),
            title: "Hello".to_string(),
            link: link.to_string(),
            authors: vec![" Ada ".to_string(), "Grace".to_string()],
            published: None,
            content: "<p>One two <b>three</b></p>".to_string(),
            tags: vec!["a".to_string(), "b".to_string()],
            featured_image: None,
            parent_feed_id: feed.id,
        }
    }

    #[tokio::test]
    async fn test_new_items_get_their_fields() {
        use crate::store::RecordStore;
        let (db, access, feed) = setup().await;
        let now = Utc::now();

        let outcome = ingest_items(
            &access,
            &feed,
            vec![payload(&feed, Some("guid-1"), "https://example.com/a")],
            now,
        )
        .await
        .unwrap();
        assert_eq!(outcome, IngestOutcome { new_items: 1, repeats: 0 });

        let id = db.find_item(feed.id, "guid-1").await.unwrap().unwrap();
        assert_eq!(
            access.read(id, "item_id").await.unwrap(),
            Some(json!(item_hash("Hello", "https://example.com/a")))
        );
        assert_eq!(access.read(id, "item_author").await.unwrap(), Some(json!("Ada, Grace")));
        assert_eq!(access.read(id, "source_title").await.unwrap(), Some(json!("Example")));
        assert_eq!(access.read(id, "pf_source_link").await.unwrap(), Some(json!("https://example.com")));
        assert_eq!(access.read(id, "item_tags").await.unwrap(), Some(json!("a, b")));
        assert_eq!(access.read(id, "pf_feed_item_word_count").await.unwrap(), Some(json!(3)));
        assert_eq!(db.get_meta(id, "pf_word_count").await.unwrap(), Some(json!(3)));
        assert_eq!(access.read(id, "sortable_item_date").await.unwrap(), Some(json!(now.timestamp())));
        assert_eq!(access.read(id, "nomination_count").await.unwrap(), Some(json!(0)));
    }

    #[tokio::test]
    async fn test_repeats_are_counted_not_duplicated() {
        use crate::store::RecordStore;
        let (db, access, feed) = setup().await;
        let items = vec![payload(&feed, None, "https://Example.com/b")];

        ingest_items(&access, &feed, items.clone(), Utc::now()).await.unwrap();
        let outcome = ingest_items(&access, &feed, items.clone(), Utc::now()).await.unwrap();
        assert_eq!(outcome, IngestOutcome { new_items: 0, repeats: 1 });
        ingest_items(&access, &feed, items, Utc::now()).await.unwrap();

        let guid = normalize_link("https://Example.com/b").unwrap();
        let id = db.find_item(feed.id, &guid).await.unwrap().unwrap();
        assert_eq!(access.read(id, "source_repeat").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_overlapping_ingests_store_one_record() {
        let (db, access, feed) = setup().await;
        let items = vec![payload(&feed, Some("g1"), "https://example.com/g1")];

        let (first, second) = tokio::join!(
            ingest_items(&access, &feed, items.clone(), Utc::now()),
            ingest_items(&access, &feed, items.clone(), Utc::now()),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.new_items + second.new_items, 1);
        assert_eq!(first.repeats + second.repeats, 1);

        let rows: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM records WHERE kind = 'pf_feed_item' AND parent_id = ?1 AND guid = 'g1'",
        )
        .bind(feed.id)
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_duplicate_item_insert_is_rejected() {
        use crate::store::RecordStore;
        let (db, _access, feed) = setup().await;
        let record = NewRecord {
            kind: RecordKind::Item,
            status: STATUS_PUBLISH.to_string(),
            title: "Hello".to_string(),
            guid: "g2".to_string(),
            parent_id: Some(feed.id),
            owner: None,
        };
        db.insert_record(&record).await.unwrap();
        assert!(matches!(
            db.insert_record(&record).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_items_without_guid_or_link_are_skipped() {
        let (_db, access, feed) = setup().await;
        let outcome = ingest_items(&access, &feed, vec![payload(&feed, None, "")], Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::default());
    }

    #[test]
    fn test_word_count_ignores_markup() {
        assert_eq!(word_count("<p>Hello, wide world</p>"), 3);
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("<img src=\"x.png\"/>"), 0);
    }
}
