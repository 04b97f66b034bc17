//! Decoding and parsing of RSS, Atom and JSON Feed documents.

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use feed_rs::model::Entry;
use feed_rs::parser;
use std::io::Cursor;
use tracing::debug;

use crate::error::FetchError;
use crate::retrieval::FeedItemPayload;
use crate::store::RecordId;
use crate::TARGET_WEB_REQUEST;

/// Feed text together with the encoding it was decoded from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedBody {
    pub text: String,
    pub encoding: &'static str,
    pub had_errors: bool,
}

/// Decodes a response body. The charset in the content type wins, then the XML
/// declaration, then UTF-8, then windows-1252.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> DecodedBody {
    let declared = content_type
        .and_then(charset_from_content_type)
        .or_else(|| charset_from_xml_declaration(bytes))
        .and_then(|label| Encoding::for_label(label.as_bytes()));

    if let Some(encoding) = declared {
        let (text, used, had_errors) = encoding.decode(bytes);
        return DecodedBody {
            text: text.into_owned(),
            encoding: used.name(),
            had_errors,
        };
    }

    let (text, used, had_errors) = UTF_8.decode(bytes);
    if !had_errors {
        return DecodedBody {
            text: text.into_owned(),
            encoding: used.name(),
            had_errors,
        };
    }

    debug!(target: TARGET_WEB_REQUEST, "Body is not UTF-8, falling back to windows-1252");
    let (text, used, had_errors) = WINDOWS_1252.decode(bytes);
    DecodedBody {
        text: text.into_owned(),
        encoding: used.name(),
        had_errors,
    }
}

fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find(|part| part.to_lowercase().starts_with("charset="))
        .and_then(|part| part.split('=').nth(1))
        .map(|charset| charset.trim().trim_matches('"').to_string())
        .filter(|charset| !charset.is_empty())
}

fn charset_from_xml_declaration(bytes: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(200)]);
    let declaration = &head[head.find("<?xml")?..];
    let declaration = &declaration[..declaration.find("?>")?];
    let start = declaration.find("encoding=")? + "encoding=".len();
    let rest = &declaration[start..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let value = &rest[1..];
    Some(value[..value.find(quote)?].to_string())
}

/// Repairs the markup problems feeds most often ship with.
pub fn cleanup_xml(xml: &str) -> String {
    let trimmed = xml.trim();
    let mut cleaned = trimmed.strip_prefix('\u{FEFF}').unwrap_or(trimmed);

    for marker in ["<?xml", "<rss", "<feed"] {
        if let Some(start) = cleaned.find(marker) {
            cleaned = &cleaned[start..];
            break;
        }
    }

    let cleaned = cleaned
        .replace("&nbsp;", "&#160;")
        .replace("&ndash;", "&#8211;")
        .replace("&mdash;", "&#8212;")
        .replace("&rsquo;", "&#8217;")
        .replace("&lsquo;", "&#8216;")
        .replace("&rdquo;", "&#8221;")
        .replace("&ldquo;", "&#8220;")
        .replace("&amp;amp;", "&amp;")
        .replace("&apos;", "&#39;");

    let cleaned: String = cleaned
        .chars()
        .filter(|&c| {
            matches!(c,
                '\u{0009}' | '\u{000A}' | '\u{000D}' |
                '\u{0020}'..='\u{D7FF}' |
                '\u{E000}'..='\u{FFFD}' |
                '\u{10000}'..='\u{10FFFF}'
            )
        })
        .collect();

    if cleaned.starts_with("<?xml") {
        cleaned
    } else {
        format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", cleaned)
    }
}

/// Parses a feed document into item payloads for `feed_id`.
///
/// Markup that fails to parse is cleaned up and tried once more. JSON feeds are
/// never cleaned.
pub fn parse_items(
    body: &str,
    content_type: Option<&str>,
    feed_id: RecordId,
) -> Result<Vec<FeedItemPayload>, FetchError> {
    let feed = match parser::parse(Cursor::new(body.as_bytes())) {
        Ok(feed) => feed,
        Err(first_err) => {
            let is_json = content_type.is_some_and(|ct| ct.contains("json"))
                || body.trim_start().starts_with('{');
            let cleaned = cleanup_xml(body);
            if is_json || !(cleaned.contains("<rss") || cleaned.contains("<feed") || cleaned.contains("<rdf")) {
                return Err(FetchError::Parse(format!(
                    "not an RSS, Atom or JSON feed ({}); starts with {:?}",
                    first_err,
                    preview(body)
                )));
            }
            debug!(target: TARGET_WEB_REQUEST, "Retrying feed parse after XML cleanup: {}", first_err);
            parser::parse(Cursor::new(cleaned.as_bytes())).map_err(|second_err| {
                FetchError::Parse(format!(
                    "failed even after cleanup. First error: {}. Second error: {}",
                    first_err, second_err
                ))
            })?
        }
    };

    Ok(feed
        .entries
        .into_iter()
        .map(|entry| to_payload(entry, feed_id))
        .collect())
}

fn to_payload(entry: Entry, feed_id: RecordId) -> FeedItemPayload {
    let link = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| entry.links.first())
        .map(|l| l.href.trim().to_string())
        .unwrap_or_default();
    let content = entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()))
        .unwrap_or_default();
    let featured_image = entry
        .media
        .iter()
        .flat_map(|m| m.thumbnails.iter())
        .map(|t| t.image.uri.clone())
        .next();

    FeedItemPayload {
        guid: Some(entry.id.trim().to_string()).filter(|id| !id.is_empty()),
        title: entry.title.map(|t| t.content.trim().to_string()).unwrap_or_default(),
        link,
        authors: entry.authors.into_iter().map(|p| p.name).collect(),
        published: entry.published.or(entry.updated),
        content,
        tags: entry
            .categories
            .into_iter()
            .map(|c| c.label.unwrap_or(c.term))
            .collect(),
        featured_image,
        parent_feed_id: feed_id,
    }
}

fn preview(body: &str) -> String {
    if body.chars().take(100).all(|c| c.is_ascii_graphic() || c.is_whitespace()) {
        body.chars().take(100).collect()
    } else {
        "[binary data]".to_string()
    }
}
