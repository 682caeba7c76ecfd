#![allow(dead_code)]

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use feedhook_core::{AppConfig, Checker, DataApi, DataDir, Feed, Webhook};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub struct TempDir(pub PathBuf);

impl TempDir {
    pub fn new(prefix: &str) -> Self {
        let mut dir = std::env::temp_dir();
        dir.push(format!("feedhook_{prefix}_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    pub fn data_dir(&self) -> DataDir {
        DataDir::new(&self.0)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// (guid, hours ago); `None` leaves out the pubDate.
pub fn sample_rss(now: DateTime<Utc>, items: &[(&str, Option<i64>)]) -> String {
    let mut body = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Test Feed</title>
    <link>http://example.com/</link>
    <description>Test description</description>
"#,
    );
    for (guid, hours_ago) in items {
        body.push_str("    <item>\n");
        body.push_str(&format!("      <title>Item {guid}</title>\n"));
        body.push_str(&format!("      <link>http://example.com/{guid}</link>\n"));
        body.push_str(&format!("      <guid>{guid}</guid>\n"));
        if let Some(hours) = hours_ago {
            let at = now - Duration::hours(*hours);
            body.push_str(&format!("      <pubDate>{}</pubDate>\n", at.to_rfc2822()));
        }
        body.push_str("      <description>&lt;p&gt;Body&lt;/p&gt;</description>\n");
        body.push_str("    </item>\n");
    }
    body.push_str("  </channel>\n</rss>\n");
    body
}

pub async fn serve_feed(server: &MockServer, body: String) {
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/rss+xml")
                .set_body_string(body),
        )
        .mount(server)
        .await;
}

pub async fn accept_webhook(server: &MockServer, hook_path: &str) {
    Mock::given(method("POST"))
        .and(path(hook_path.to_string()))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
}

/// Titles of the embeds POSTed to `hook_path`, in arrival order.
pub async fn posted_titles(server: &MockServer, hook_path: &str) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == "POST" && r.url.path() == hook_path)
        .map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            body["embeds"][0]["title"].as_str().unwrap_or_default().to_owned()
        })
        .collect()
}

pub fn feed_for(server: &MockServer, hooks: &[&str]) -> Feed {
    let webhooks = hooks
        .iter()
        .map(|h| Webhook::new(format!("{}{h}", server.uri()), *h))
        .collect();
    let mut feed = Feed::new("Test", format!("{}/feed", server.uri()), webhooks);
    feed.update_interval = 60;
    feed
}

pub fn open(dir: &DataDir) -> (DataApi, Checker) {
    let config = AppConfig::default();
    let data = DataApi::open(dir, &config);
    let checker = Checker::from_config(data.clone(), &config).unwrap();
    (data, checker)
}
