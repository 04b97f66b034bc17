//! Feed diagnostics for the `test_feed` tool and the single-feed check.

use serde::Serialize;

use super::client::{download, is_valid_url};
use super::parser::parse_items;
use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FeedStatus {
    Success,
    InvalidUrl,
    RequestFailed,
    InvalidEncoding,
    ParseError,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub title: String,
    pub link: String,
    pub published: Option<String>,
}

/// What happened when a feed URL was fetched and parsed.
#[derive(Debug, Clone, Serialize)]
pub struct FeedDiagnosis {
    pub url: String,
    pub status: FeedStatus,
    pub content_type: Option<String>,
    pub detected_encoding: Option<String>,
    pub decoded_preview: Option<String>,
    pub headers: Vec<(String, String)>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub entries: Vec<EntryInfo>,
}

impl FeedDiagnosis {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            status: FeedStatus::Success,
            content_type: None,
            detected_encoding: None,
            decoded_preview: None,
            headers: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            entries: Vec::new(),
        }
    }

    fn fail(mut self, status: FeedStatus, error: String) -> Self {
        self.status = status;
        self.errors.push(error);
        self
    }
}

pub async fn diagnose_feed(url: &str) -> FeedDiagnosis {
    let diagnosis = FeedDiagnosis::new(url);
    if !is_valid_url(url) {
        return diagnosis.fail(FeedStatus::InvalidUrl, format!("Invalid URL format: {}", url));
    }

    match download(url).await {
        Ok(download) => {
            let mut diagnosis = diagnosis;
            if download.browser_emulation {
                diagnosis
                    .warnings
                    .push("Request succeeded using browser emulation after the standard request failed".to_string());
            }
            diagnosis.content_type = download.content_type.clone();
            diagnosis.headers = download.headers;
            diagnosis.detected_encoding = Some(download.body.encoding.to_string());
            diagnosis.decoded_preview = Some(download.body.text.chars().take(200).collect());
            if download.body.had_errors {
                diagnosis.status = FeedStatus::InvalidEncoding;
                diagnosis
                    .warnings
                    .push(format!("Body had invalid {} sequences", download.body.encoding));
            }

            match parse_items(&download.body.text, download.content_type.as_deref(), 0) {
                Ok(items) => {
                    diagnosis.entries = items
                        .into_iter()
                        .map(|item| EntryInfo {
                            title: item.title,
                            link: item.link,
                            published: item.published.map(|d| d.to_rfc3339()),
                        })
                        .collect();
                    diagnosis
                }
                Err(err) => diagnosis.fail(FeedStatus::ParseError, err.to_string()),
            }
        }
        Err(FetchError::InvalidFeed(msg)) => diagnosis.fail(FeedStatus::InvalidUrl, msg),
        Err(err) => diagnosis.fail(FeedStatus::RequestFailed, err.to_string()),
    }
}
