use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dispatch::Outcome;

pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 300;
pub const MIN_UPDATE_INTERVAL_SECS: u64 = 10;

fn default_update_interval() -> u64 {
    DEFAULT_UPDATE_INTERVAL_SECS
}

/// Top-level shape of `config.json`. Keys other than `FEEDS` are kept as-is.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ConfigFile {
    #[serde(rename = "FEEDS", default)]
    pub feeds: Vec<Feed>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfigFile {
    pub fn feed(&self, feed_id: &str) -> Option<&Feed> {
        self.feeds.iter().find(|f| f.id == feed_id)
    }

    pub fn feed_mut(&mut self, feed_id: &str) -> Option<&mut Feed> {
        self.feeds.iter_mut().find(|f| f.id == feed_id)
    }

    /// Replaces a feed with the same id in place, or appends it.
    pub fn upsert(&mut self, feed: Feed) {
        match self.feed_mut(&feed.id) {
            Some(slot) => *slot = feed,
            None => self.feeds.push(feed),
        }
    }

    pub fn remove(&mut self, feed_id: &str) -> Option<Feed> {
        let idx = self.feeds.iter().position(|f| f.id == feed_id)?;
        Some(self.feeds.remove(idx))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Webhook {
    pub url: String,
    #[serde(default)]
    pub label: String,
}

impl Webhook {
    pub fn new(url: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feed {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default)]
    pub webhooks: Vec<Webhook>,
    // older configs carried a single url or a bare list of urls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhook_urls: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Feed {
    pub fn new(name: impl Into<String>, url: impl Into<String>, webhooks: Vec<Webhook>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            url: url.into(),
            update_interval: DEFAULT_UPDATE_INTERVAL_SECS,
            active: Some(true),
            webhooks,
            webhook_url: None,
            webhook_urls: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.url
        } else {
            &self.name
        }
    }

    pub fn is_paused(&self) -> bool {
        self.active == Some(false)
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.active = Some(!paused);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.update_interval.max(MIN_UPDATE_INTERVAL_SECS))
    }

    /// Destinations in configured order. Legacy fields are consulted only when
    /// `webhooks` is empty, and duplicate urls are dropped.
    pub fn destinations(&self) -> Vec<Webhook> {
        let mut out: Vec<Webhook> = Vec::new();
        let legacy = self
            .webhook_url
            .iter()
            .chain(self.webhook_urls.iter())
            .map(|url| Webhook::new(url.clone(), ""));
        let all: Vec<Webhook> = if self.webhooks.is_empty() {
            legacy.collect()
        } else {
            self.webhooks.clone()
        };
        for hook in all {
            if !hook.url.trim().is_empty() && !out.iter().any(|h| h.url == hook.url) {
                out.push(hook);
            }
        }
        out
    }

    /// Folds legacy webhook fields into `webhooks`.
    pub fn normalize(&mut self) {
        let hooks = self.destinations();
        self.webhooks = hooks;
        self.webhook_url = None;
        self.webhook_urls.clear();
    }
}

/// Result of the fetch half of a check, shown on the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CheckStatus {
    Http(u16),
    Transport(String),
    Parse(String),
    /// Body exceeded the configured limit, in bytes.
    TooLarge(usize),
    StoreBusy,
    Error(String),
}

impl CheckStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Http(code) if (200..300).contains(code))
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(code) => write!(f, "{code}"),
            Self::Transport(reason) => write!(f, "unreachable: {reason}"),
            Self::Parse(reason) => write!(f, "parse error: {reason}"),
            Self::TooLarge(limit) => write!(f, "feed larger than {limit} bytes"),
            Self::StoreBusy => f.write_str("store busy"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastPost {
    pub status: Outcome,
    pub timestamp: DateTime<Utc>,
}

/// Runtime status of a feed, persisted in `feed_state.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FeedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<CheckStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_post: Option<LastPost>,
}

pub type FeedStateMap = BTreeMap<String, FeedState>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Article {
    pub identifier: String,
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub author: Option<String>,
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

impl Article {
    /// Builds an article from an RSS item; `None` when the item has neither a
    /// guid nor a link to identify it by.
    pub fn from_rss_item(item: &rss::Item) -> Option<Self> {
        let link = non_empty(item.link());
        let identifier = non_empty(item.guid().map(|g| g.value())).or_else(|| link.clone())?;

        let published_at = item.pub_date().and_then(parse_date).or_else(|| {
            item.dublin_core_ext()
                .and_then(|dc| dc.dates().first().and_then(|d| parse_date(d)))
        });

        let author = item
            .dublin_core_ext()
            .and_then(|dc| dc.creators().first().map(|s| s.to_string()))
            .or_else(|| item.author().map(|s| s.to_string()));

        Some(Self {
            identifier,
            title: item.title().unwrap_or_default().trim().to_owned(),
            link: link.unwrap_or_default(),
            published_at,
            summary: non_empty(item.description()).or_else(|| non_empty(item.content())),
            author,
        })
    }

    pub fn from_atom_entry(entry: &atom_syndication::Entry) -> Option<Self> {
        let link = entry
            .links()
            .iter()
            .find(|l| l.rel() == "alternate")
            .or_else(|| entry.links().first())
            .map(|l| l.href().to_owned())
            .filter(|href| !href.is_empty());
        let identifier = non_empty(Some(entry.id())).or_else(|| link.clone())?;

        let published_at = entry
            .published()
            .copied()
            .unwrap_or_else(|| *entry.updated())
            .with_timezone(&Utc);

        Some(Self {
            identifier,
            title: entry.title().as_str().trim().to_owned(),
            link: link.unwrap_or_default(),
            published_at: Some(published_at),
            summary: non_empty(entry.summary().map(|s| s.as_str()))
                .or_else(|| non_empty(entry.content().and_then(|c| c.value()))),
            author: entry.authors().first().map(|p| p.name().to_owned()),
        })
    }
}
