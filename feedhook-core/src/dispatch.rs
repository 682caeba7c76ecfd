use std::time::Duration;

use html2text::render::text_renderer::TrivialDecorator;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::feed::Article;

pub const EMBED_COLOR: u32 = 5_814_783;
const SUMMARY_LIMIT: usize = 250;
const TITLE_LIMIT: usize = 256;

/// Result of one webhook POST.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RateLimited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<f64>,
    },
    Failed {
        reason: String,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } if secs.is_finite() && *secs >= 0.0 => Some(Duration::from_secs_f64(*secs)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("Success"),
            Self::RateLimited { .. } => f.write_str("RateLimited"),
            Self::Failed { reason } => write!(f, "Failed: {reason}"),
        }
    }
}

/// Strips markup and collapses whitespace.
pub fn plain_text(html: &str) -> String {
    let text = html2text::from_read_with_decorator(html.as_bytes(), 10_000, TrivialDecorator::new());
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_owned();
    }
    let mut cut: String = text.chars().take(limit.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

/// Discord embed for one article.
pub fn build_embed(article: &Article, feed_name: &str) -> Value {
    let title = if article.title.is_empty() {
        "No Title".to_owned()
    } else {
        truncate(&article.title, TITLE_LIMIT)
    };
    let summary = article
        .summary
        .as_deref()
        .map(plain_text)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "No summary available.".to_owned());

    let mut embed = json!({
        "title": title,
        "url": article.link,
        "description": truncate(&summary, SUMMARY_LIMIT),
        "color": EMBED_COLOR,
        "footer": { "text": format!("From: {feed_name}") },
    });
    if let Some(published) = article.published_at {
        embed["timestamp"] = Value::String(published.to_rfc3339());
    }
    if let Some(author) = article.author.as_deref().filter(|a| !a.is_empty()) {
        embed["author"] = json!({ "name": truncate(author, TITLE_LIMIT) });
    }
    embed
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: Client,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// POSTs `{"embeds": [embed]}`. Never retries; a 429 is reported with the
    /// server's retry-after so the caller can surface it.
    pub async fn send(&self, webhook_url: &str, embed: &Value) -> Outcome {
        let payload = json!({ "embeds": [embed] });
        let response = match self
            .client
            .post(webhook_url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(webhook = %redact(webhook_url), error = %err, "failed to connect to webhook");
                return Outcome::Failed {
                    reason: format!("connection: {err}"),
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!(webhook = %redact(webhook_url), %status, "webhook accepted embed");
            return Outcome::Success;
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let header_secs = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok());
            let body_secs = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body.get("retry_after").and_then(Value::as_f64));
            let retry_after_secs = header_secs.or(body_secs);
            warn!(webhook = %redact(webhook_url), ?retry_after_secs, "rate limited by webhook");
            return Outcome::RateLimited { retry_after_secs };
        }

        let body = response.text().await.unwrap_or_default();
        warn!(webhook = %redact(webhook_url), %status, body = %truncate(&body, 200), "webhook rejected embed");
        Outcome::Failed {
            reason: format!("HTTP {}", status.as_u16()),
        }
    }
}

/// Webhook urls embed a secret token; keep it out of logs.
pub fn redact(webhook_url: &str) -> String {
    match url::Url::parse(webhook_url) {
        Ok(url) => {
            let mut segments: Vec<&str> = url.path().split('/').collect();
            if segments.len() > 2 {
                if let Some(last) = segments.last_mut() {
                    *last = "***";
                }
            }
            format!("{}://{}{}", url.scheme(), url.host_str().unwrap_or(""), segments.join("/"))
        }
        Err(_) => "<invalid url>".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn article(summary: Option<&str>) -> Article {
        Article {
            identifier: "1".into(),
            title: "Hello".into(),
            link: "http://example.com/1".into(),
            published_at: Some(Utc.with_ymd_and_hms(2024, 10, 21, 7, 28, 0).unwrap()),
            summary: summary.map(Into::into),
            author: None,
        }
    }

    #[test]
    fn embed_strips_html_and_truncates_summary() {
        let long = format!("<p>{}</p>", "word ".repeat(100));
        let embed = build_embed(&article(Some(&long)), "News");
        let description = embed["description"].as_str().unwrap();
        assert!(!description.contains('<'));
        assert_eq!(description.chars().count(), SUMMARY_LIMIT);
        assert!(description.ends_with("..."));
        assert_eq!(embed["footer"]["text"], "From: News");
        assert_eq!(embed["color"], EMBED_COLOR);
        assert_eq!(embed["timestamp"], "2024-10-21T07:28:00+00:00");
    }

    #[test]
    fn embed_defaults_missing_fields() {
        let mut a = article(None);
        a.title.clear();
        a.published_at = None;
        let embed = build_embed(&a, "News");
        assert_eq!(embed["title"], "No Title");
        assert_eq!(embed["description"], "No summary available.");
        assert!(embed.get("timestamp").is_none());
    }

    #[test]
    fn outcome_display_matches_dashboard_labels() {
        let limited = Outcome::RateLimited {
            retry_after_secs: Some(30.0),
        };
        assert_eq!(limited.to_string(), "RateLimited");
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(Outcome::Success.to_string(), "Success");
    }

    #[test]
    fn redact_hides_webhook_token() {
        assert_eq!(
            redact("https://discord.com/api/webhooks/123/secret-token"),
            "https://discord.com/api/webhooks/123/***"
        );
    }
}
