//! HTTP access to feed endpoints.

use reqwest::{cookie::Jar, header};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use super::parser::{decode_body, DecodedBody};
use crate::error::FetchError;
use crate::TARGET_WEB_REQUEST;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

const STANDARD_USER_AGENT: &str = "Mozilla/5.0 (compatible; PressForward/0.5; +https://pressforward.org)";
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:138.0) Gecko/20100101 Firefox/138.0";
const FEED_ACCEPT: &str = "application/feed+json, application/json, application/rss+xml, application/atom+xml, application/xml, text/xml, */*;q=0.9";

/// Only http and https feeds are fetched.
pub fn is_valid_url(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.scheme() == "http" || parsed.scheme() == "https",
        Err(_) => false,
    }
}

pub fn create_http_client(browser_emulation: bool) -> Result<reqwest::Client, FetchError> {
    if browser_emulation {
        debug!(target: TARGET_WEB_REQUEST, "Creating browser emulation HTTP client");
    } else {
        debug!(target: TARGET_WEB_REQUEST, "Creating standard HTTP client");
    }

    Ok(reqwest::Client::builder()
        .cookie_store(true)
        .cookie_provider(Arc::new(Jar::default()))
        .gzip(true)
        .redirect(reqwest::redirect::Policy::default())
        .build()?)
}

/// Tries a plain feed-reader request first, then again with browser headers for
/// endpoints that refuse unknown clients. The flag reports whether emulation was needed.
pub async fn fetch_with_fallback(url: &str) -> Result<(reqwest::Response, bool), FetchError> {
    debug!(target: TARGET_WEB_REQUEST, "Attempting standard request to {}", url);

    let standard_client = create_http_client(false)?;
    let standard = timeout(
        REQUEST_TIMEOUT,
        standard_client
            .get(url)
            .header(header::USER_AGENT, STANDARD_USER_AGENT)
            .header(header::ACCEPT, FEED_ACCEPT)
            .send(),
    )
    .await;

    let first_failure = match standard {
        Ok(Ok(resp)) if resp.status().is_success() => {
            debug!(target: TARGET_WEB_REQUEST, "Standard request to {} succeeded", url);
            return Ok((resp, false));
        }
        Ok(Ok(resp)) => format!("HTTP error: {}", resp.status()),
        Ok(Err(err)) => format!("request failed: {}", err),
        Err(_) => format!("timed out after {} seconds", REQUEST_TIMEOUT.as_secs()),
    };
    debug!(target: TARGET_WEB_REQUEST, "Standard request to {} failed ({}), trying browser emulation", url, first_failure);

    let browser_client = create_http_client(true)?;
    let emulated = timeout(
        REQUEST_TIMEOUT,
        browser_client
            .get(url)
            .header(header::USER_AGENT, BROWSER_USER_AGENT)
            .header(header::ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.5")
            .header("DNT", "1")
            .header("Upgrade-Insecure-Requests", "1")
            .header("Sec-Fetch-Dest", "document")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Sec-Fetch-Site", "none")
            .send(),
    )
    .await;

    let second_failure = match emulated {
        Ok(Ok(resp)) if resp.status().is_success() => {
            info!(target: TARGET_WEB_REQUEST, "Browser emulation request to {} succeeded", url);
            return Ok((resp, true));
        }
        Ok(Ok(resp)) => format!("HTTP error: {}", resp.status()),
        Ok(Err(err)) => format!("request failed: {}", err),
        Err(_) => format!("timed out after {} seconds", REQUEST_TIMEOUT.as_secs()),
    };

    Err(FetchError::Offline(format!(
        "{}: standard {}; browser emulation {}",
        url, first_failure, second_failure
    )))
}

/// A fetched and decoded feed document.
#[derive(Debug)]
pub struct Download {
    pub body: DecodedBody,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub browser_emulation: bool,
}

pub async fn download(url: &str) -> Result<Download, FetchError> {
    let (response, browser_emulation) = fetch_with_fallback(url).await?;

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .map(|s| s.to_lowercase());
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

    let bytes = response.bytes().await?;
    let body = decode_body(&bytes, content_type.as_deref());
    debug!(
        target: TARGET_WEB_REQUEST,
        "Read {} bytes from {} as {}",
        bytes.len(),
        url,
        body.encoding
    );

    Ok(Download {
        body,
        content_type,
        headers,
        browser_emulation,
    })
}

/// [`download`] with up to `attempts` tries, pausing between them.
pub async fn download_with_retries(url: &str, attempts: usize) -> Result<Download, FetchError> {
    let mut attempt = 1;
    loop {
        match download(url).await {
            Ok(download) => return Ok(download),
            Err(err) if attempt < attempts => {
                warn!(target: TARGET_WEB_REQUEST, "Attempt {} for {} failed: {}", attempt, url, err);
                attempt += 1;
                sleep(RETRY_DELAY).await;
            }
            Err(err) => return Err(err),
        }
    }
}
