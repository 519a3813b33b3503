use std::time::Duration;

use chrono::{DateTime, Utc};
use quick_xml::{events::Event, DeError, Reader};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

/// Layout of `pubDate` values after the weekday, e.g. `02 Jan 2006 15:04:05 -0700`.
pub const PUB_DATE_FORMAT: &str = "%d %b %Y %H:%M:%S %z";

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

const ACCEPTED_CONTENT_TYPES: [&str; 2] = ["application/xml", "text/xml"];

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {0}")]
    Status(StatusCode),
    #[error("unexpected Content-Type: {0}")]
    ContentType(String),
    #[error("error parsing feed: {0}")]
    Decode(#[from] DeError),
    #[error("error parsing feed: root element is <{0}>, expected <rss>")]
    NotRss(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PubDateError {
    #[error("expected a weekday prefix like \"Mon, \" in {0:?}")]
    Weekday(String),
    #[error(transparent)]
    Parse(#[from] chrono::ParseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RssFeed {
    pub channel: RssChannel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RssChannel {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub language: String,
    #[serde(rename = "item", default)]
    pub items: Vec<RssItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RssItem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "pubDate", default)]
    pub pub_date: String,
}

impl RssItem {
    pub fn published_at(&self) -> Result<DateTime<Utc>, PubDateError> {
        parse_pub_date(&self.pub_date)
    }
}

/// Decodes an RSS 2.0 document. Only the channel header and items are kept.
pub fn parse_feed(data: &[u8]) -> Result<RssFeed, FetchError> {
    if let Some(root) = root_element(data)? {
        if root != "rss" {
            return Err(FetchError::NotRss(root));
        }
    }

    let feed = quick_xml::de::from_reader(data)?;
    Ok(feed)
}

/// Name of the first element in the document, `None` if there is none.
fn root_element(data: &[u8]) -> Result<Option<String>, DeError> {
    let mut reader = Reader::from_reader(data);
    loop {
        match reader.read_event().map_err(DeError::from)? {
            Event::Start(e) | Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                return Ok(Some(name));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Parses `Mon, 02 Jan 2006 15:04:05 -0700`. The weekday has to be a known
/// abbreviation but is not checked against the date, so feeds with a wrong
/// weekday still parse.
pub fn parse_pub_date(value: &str) -> Result<DateTime<Utc>, PubDateError> {
    let value = value.trim();
    let rest = value
        .split_once(", ")
        .filter(|(weekday, _)| WEEKDAYS.iter().any(|day| day.eq_ignore_ascii_case(weekday)))
        .map(|(_, rest)| rest)
        .ok_or_else(|| PubDateError::Weekday(value.to_string()))?;

    let parsed = DateTime::parse_from_str(rest, PUB_DATE_FORMAT)?;
    Ok(parsed.with_timezone(&Utc))
}

fn is_xml_content_type(content_type: &str) -> bool {
    ACCEPTED_CONTENT_TYPES
        .iter()
        .any(|accepted| content_type.starts_with(accepted))
}

/// HTTP client for remote feeds. Cloning shares the connection pool only.
#[derive(Debug, Clone)]
pub struct FeedClient {
    client: Client,
}

impl FeedClient {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("RssAggregator/1.0 (RSS Aggregator)")
            .build()?;

        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<RssFeed, FetchError> {
        debug!(url, "Fetching feed");

        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !is_xml_content_type(&content_type) {
            return Err(FetchError::ContentType(content_type));
        }

        let bytes = response.bytes().await?;
        let feed = parse_feed(&bytes)?;

        debug!(url, items = feed.channel.items.len(), "Parsed feed");
        Ok(feed)
    }
}
