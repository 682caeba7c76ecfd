use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use crate::feed::{Article, CheckStatus};

/// Single-pass iterator over the articles of one fetch, in feed order.
/// Items are converted on demand; items with no usable identifier are skipped.
#[derive(Debug, Default)]
pub enum Articles {
    #[default]
    Empty,
    Rss(std::vec::IntoIter<rss::Item>),
    Atom(std::vec::IntoIter<atom_syndication::Entry>),
}

impl Iterator for Articles {
    type Item = Article;

    fn next(&mut self) -> Option<Article> {
        loop {
            let next = match self {
                Self::Empty => return None,
                Self::Rss(items) => Article::from_rss_item(&items.next()?),
                Self::Atom(entries) => Article::from_atom_entry(&entries.next()?),
            };
            if next.is_some() {
                return next;
            }
        }
    }
}

#[derive(Debug)]
pub struct FetchResult {
    pub status: CheckStatus,
    pub articles: Articles,
}

impl FetchResult {
    fn failed(status: CheckStatus) -> Self {
        Self {
            status,
            articles: Articles::Empty,
        }
    }
}

/// Parses an RSS 2.0 or Atom document.
pub fn parse_feed(bytes: &[u8]) -> Result<Articles, String> {
    let rss_err = match rss::Channel::read_from(bytes) {
        Ok(channel) => return Ok(Articles::Rss(channel.into_items().into_iter())),
        Err(e) => e,
    };
    match atom_syndication::Feed::read_from(bytes) {
        Ok(feed) => Ok(Articles::Atom(feed.entries.into_iter())),
        Err(atom_err) => Err(format!("RSS: ({rss_err}) Atom: ({atom_err})")),
    }
}

#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: Client,
    timeout: Duration,
    max_body_bytes: usize,
}

pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

impl FeedFetcher {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes.max(1);
        self
    }

    /// Never fails: transport, HTTP and parse problems come back as the status.
    pub async fn fetch(&self, url: &str) -> FetchResult {
        let mut response = match self.client.get(url).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(feed = %url, error = %err, "failed to reach feed");
                return FetchResult::failed(CheckStatus::Transport(transport_reason(&err)));
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(feed = %url, %status, "feed returned error status");
            return FetchResult::failed(CheckStatus::Http(status.as_u16()));
        }

        let limit = self.max_body_bytes;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            warn!(feed = %url, limit, "feed body too large");
            return FetchResult::failed(CheckStatus::TooLarge(limit));
        }

        let mut bytes: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if bytes.len() + chunk.len() > limit {
                        warn!(feed = %url, limit, "feed body too large");
                        return FetchResult::failed(CheckStatus::TooLarge(limit));
                    }
                    bytes.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(feed = %url, error = %err, "failed to read feed body");
                    return FetchResult::failed(CheckStatus::Transport(transport_reason(&err)));
                }
            }
        }

        match parse_feed(&bytes) {
            Ok(articles) => {
                debug!(feed = %url, bytes = bytes.len(), "fetched feed");
                FetchResult {
                    status: CheckStatus::Http(status.as_u16()),
                    articles,
                }
            }
            Err(reason) => {
                warn!(feed = %url, error = %reason, "failed to parse feed");
                FetchResult::failed(CheckStatus::Parse(reason))
            }
        }
    }
}

fn transport_reason(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "timed out".to_owned()
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_atom_when_rss_fails() {
        let atom = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example</title>
  <id>urn:feed</id>
  <updated>2024-10-21T08:00:00Z</updated>
  <entry>
    <title>Entry</title>
    <id>urn:entry:1</id>
    <link href="http://example.com/e1"/>
    <updated>2024-10-21T08:00:00Z</updated>
    <summary>Body</summary>
  </entry>
</feed>"#;
        let articles: Vec<Article> = parse_feed(atom.as_bytes()).unwrap().collect();
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].identifier, "urn:entry:1");
        assert_eq!(articles[0].link, "http://example.com/e1");
        assert!(articles[0].published_at.is_some());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(parse_feed(b"<html><body>nope</body></html>").is_err());
    }

    #[test]
    fn skips_items_without_identity() {
        let rss = r#"<?xml version="1.0"?><rss version="2.0"><channel><title>T</title><link>http://e</link><description>d</description>
<item><title>no id</title></item>
<item><title>A</title><link>http://e/1</link></item>
</channel></rss>"#;
        let ids: Vec<String> = parse_feed(rss.as_bytes())
            .unwrap()
            .map(|a| a.identifier)
            .collect();
        assert_eq!(ids, vec!["http://e/1"]);
    }
}
