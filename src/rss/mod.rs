//! The RSS fetch module: downloads a feed, decodes it and turns its entries into
//! item payloads. Atom and JSON Feed documents are read the same way.

mod client;
mod diagnose;
mod parser;

use async_trait::async_trait;
use tracing::debug;

pub use self::client::{create_http_client, fetch_with_fallback, is_valid_url};
pub use self::diagnose::{diagnose_feed, EntryInfo, FeedDiagnosis, FeedStatus};
pub use self::parser::{cleanup_xml, decode_body, parse_items, DecodedBody};

use crate::error::FetchError;
use crate::retrieval::{Feed, FeedItemPayload, FetchModule};
use crate::TARGET_WEB_REQUEST;

pub const RSS_FEED_KIND: &str = "rss";

const DEFAULT_ATTEMPTS: usize = 2;

#[derive(Clone, Debug)]
pub struct RssModule {
    attempts: usize,
}

impl RssModule {
    pub fn new() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    pub fn with_attempts(attempts: usize) -> Self {
        Self {
            attempts: attempts.max(1),
        }
    }
}

impl Default for RssModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FetchModule for RssModule {
    fn name(&self) -> &str {
        RSS_FEED_KIND
    }

    fn matches(&self, feed_kind: &str) -> bool {
        feed_kind == RSS_FEED_KIND
    }

    async fn fetch(&self, feed: &Feed) -> Result<Vec<FeedItemPayload>, FetchError> {
        if !is_valid_url(&feed.url) {
            return Err(FetchError::InvalidFeed(format!("{} is not an http(s) URL", feed.url)));
        }

        let download = client::download_with_retries(&feed.url, self.attempts).await?;
        let items = parse_items(&download.body.text, download.content_type.as_deref(), feed.id)?;
        debug!(target: TARGET_WEB_REQUEST, "Parsed {} entries from {}", items.len(), feed.url);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_http_feeds_without_a_request() {
        let feed = Feed {
            id: 1,
            title: "Local".to_string(),
            status: "publish".to_string(),
            kind: RSS_FEED_KIND.to_string(),
            url: "file:///etc/passwd".to_string(),
            html_url: None,
            default_author: None,
            error_count: 0,
            last_retrieved: None,
        };
        let err = RssModule::new().fetch(&feed).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidFeed(_)));
        assert!(RssModule::new().matches("rss"));
        assert!(!RssModule::new().matches("opml"));
    }
}
