//! Fetch modules turn a feed into normalized item payloads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::feeds::Feed;
use crate::error::FetchError;
use crate::rss::RssModule;
use crate::store::RecordId;
use crate::TARGET_RETRIEVAL;

/// One item as a fetch module hands it over, before it becomes a record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FeedItemPayload {
    pub guid: Option<String>,
    pub title: String,
    pub link: String,
    pub authors: Vec<String>,
    pub published: Option<DateTime<Utc>>,
    pub content: String,
    pub tags: Vec<String>,
    pub featured_image: Option<String>,
    pub parent_feed_id: RecordId,
}

#[async_trait]
pub trait FetchModule: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, feed_kind: &str) -> bool;

    async fn fetch(&self, feed: &Feed) -> Result<Vec<FeedItemPayload>, FetchError>;
}

/// Maps feed kinds to the module that retrieves them.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn FetchModule>>,
    aliases: HashMap<String, String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The RSS module, also answering for `rss-quick` feeds.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_module(Arc::new(RssModule::new()))
            .with_alias("rss-quick", "rss")
    }

    pub fn with_module(mut self, module: Arc<dyn FetchModule>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn with_alias(mut self, kind: &str, target: &str) -> Self {
        self.aliases.insert(kind.to_string(), target.to_string());
        self
    }

    pub fn resolve(&self, feed_kind: &str) -> Option<Arc<dyn FetchModule>> {
        let kind = self
            .aliases
            .get(feed_kind)
            .map(String::as_str)
            .unwrap_or(feed_kind);
        let module = self.modules.iter().find(|m| m.matches(kind)).cloned();
        if module.is_none() {
            debug!(target: TARGET_RETRIEVAL, "No module registered for feed kind {}", feed_kind);
        }
        module
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }
}
