use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, DataDir};
use crate::error::{ConfigError, StoreError};
use crate::feed::{CheckStatus, ConfigFile, Feed, FeedState, FeedStateMap, LastPost, Webhook};
use crate::persist::LockedJsonFile;
use crate::storage::SentStore;

/// Data accessors and mutators the dashboard drives. No authorization happens
/// here; callers check roles before calling in.
#[derive(Debug, Clone)]
pub struct DataApi {
    feeds: LockedJsonFile,
    state: LockedJsonFile,
    sent: SentStore,
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    url::Url::parse(url)
        .map(|_| ())
        .map_err(|source| ConfigError::InvalidUrl {
            url: url.to_owned(),
            source,
        })
}

fn validate_feed(feed: &Feed) -> Result<(), ConfigError> {
    validate_url(&feed.url)?;
    for hook in feed.destinations() {
        validate_url(&hook.url)?;
    }
    Ok(())
}

impl DataApi {
    pub fn open(dir: &DataDir, config: &AppConfig) -> Self {
        let lock_timeout = config.store.lock_timeout();
        Self {
            feeds: LockedJsonFile::new(dir.feeds(), lock_timeout).strict(),
            state: LockedJsonFile::new(dir.feed_state(), lock_timeout),
            sent: SentStore::open(dir.sent_articles(), lock_timeout)
                .with_cap(config.store.sent_cap, config.store.prune_scope),
        }
    }

    pub fn sent_store(&self) -> &SentStore {
        &self.sent
    }

    /// Creates an empty `config.json` when there is none yet.
    pub async fn init_files(&self) -> Result<(), ConfigError> {
        if tokio::fs::metadata(self.feeds.path()).await.is_err() {
            self.feeds.update(|_: &mut ConfigFile| ()).await?;
            info!(path = %self.feeds.path().display(), "created empty feed config");
        }
        Ok(())
    }

    pub async fn load_config(&self) -> Result<ConfigFile, ConfigError> {
        Ok(self.feeds.read().await?)
    }

    pub async fn list_feeds(&self) -> Result<Vec<Feed>, ConfigError> {
        Ok(self.load_config().await?.feeds)
    }

    pub async fn get_feed(&self, feed_id: &str) -> Result<Feed, ConfigError> {
        self.load_config()
            .await?
            .feed(feed_id)
            .cloned()
            .ok_or_else(|| ConfigError::FeedNotFound(feed_id.to_owned()))
    }

    pub async fn add_feed(&self, mut feed: Feed) -> Result<Feed, ConfigError> {
        validate_feed(&feed)?;
        feed.normalize();
        if feed.id.is_empty() {
            feed.id = uuid::Uuid::new_v4().to_string();
        }
        let added = feed.clone();
        self.feeds
            .update(move |config: &mut ConfigFile| config.upsert(feed))
            .await?;
        info!(feed = %added.id, url = %added.url, "feed added");
        Ok(added)
    }

    /// Replaces an existing feed. Sent records of webhooks that were removed
    /// are dropped so a re-added webhook gets a fresh first check.
    pub async fn update_feed(&self, mut feed: Feed) -> Result<Feed, ConfigError> {
        validate_feed(&feed)?;
        feed.normalize();
        let updated = feed.clone();
        let previous = self
            .feeds
            .update(move |config: &mut ConfigFile| {
                let slot = config.feed_mut(&feed.id)?;
                Some(std::mem::replace(slot, feed))
            })
            .await?
            .ok_or_else(|| ConfigError::FeedNotFound(updated.id.clone()))?;

        let kept = updated.destinations();
        for hook in previous.destinations() {
            if !kept.iter().any(|h| h.url == hook.url) {
                self.sent.forget_webhook(&updated.id, &hook.url).await?;
            }
        }
        debug!(feed = %updated.id, "feed updated");
        Ok(updated)
    }

    pub async fn delete_feed(&self, feed_id: &str) -> Result<Feed, ConfigError> {
        let removed = self
            .feeds
            .update(|config: &mut ConfigFile| config.remove(feed_id))
            .await?
            .ok_or_else(|| ConfigError::FeedNotFound(feed_id.to_owned()))?;
        let forgotten = self.sent.forget_feed(feed_id).await?;
        self.state
            .update(|states: &mut FeedStateMap| states.remove(feed_id))
            .await?;
        info!(feed = %feed_id, forgotten, "feed deleted");
        Ok(removed)
    }

    async fn modify_feed<F>(&self, feed_id: &str, change: F) -> Result<Feed, ConfigError>
    where
        F: FnOnce(&mut Feed),
    {
        self.feeds
            .update(|config: &mut ConfigFile| {
                config.feed_mut(feed_id).map(|feed| {
                    change(feed);
                    feed.clone()
                })
            })
            .await?
            .ok_or_else(|| ConfigError::FeedNotFound(feed_id.to_owned()))
    }

    pub async fn set_paused(&self, feed_id: &str, paused: bool) -> Result<Feed, ConfigError> {
        let feed = self.modify_feed(feed_id, |f| f.set_paused(paused)).await?;
        info!(feed = %feed_id, paused, "feed pause state changed");
        Ok(feed)
    }

    /// Flips the pause flag; returns whether the feed is now paused.
    pub async fn toggle_pause(&self, feed_id: &str) -> Result<bool, ConfigError> {
        let feed = self
            .modify_feed(feed_id, |f| {
                let paused = f.is_paused();
                f.set_paused(!paused);
            })
            .await?;
        Ok(feed.is_paused())
    }

    pub async fn add_webhook(&self, feed_id: &str, webhook: Webhook) -> Result<Feed, ConfigError> {
        validate_url(&webhook.url)?;
        self.modify_feed(feed_id, |f| {
            f.normalize();
            if !f.webhooks.iter().any(|h| h.url == webhook.url) {
                f.webhooks.push(webhook);
            }
        })
        .await
    }

    pub async fn remove_webhook(&self, feed_id: &str, webhook_url: &str) -> Result<Feed, ConfigError> {
        let mut found = false;
        let feed = self
            .modify_feed(feed_id, |f| {
                f.normalize();
                let before = f.webhooks.len();
                f.webhooks.retain(|h| h.url != webhook_url);
                found = f.webhooks.len() != before;
            })
            .await?;
        if !found {
            return Err(ConfigError::WebhookNotFound {
                feed: feed_id.to_owned(),
                webhook: webhook_url.to_owned(),
            });
        }
        self.sent.forget_webhook(feed_id, webhook_url).await?;
        Ok(feed)
    }

    pub async fn feed_states(&self) -> Result<FeedStateMap, ConfigError> {
        Ok(self.state.read().await?)
    }

    pub async fn feed_state(&self, feed_id: &str) -> Result<FeedState, ConfigError> {
        Ok(self.feed_states().await?.remove(feed_id).unwrap_or_default())
    }

    /// Writes the outcome of a check cycle for the dashboard.
    pub async fn record_check(
        &self,
        feed_id: &str,
        status: CheckStatus,
        checked_at: DateTime<Utc>,
        last_post: Option<LastPost>,
    ) -> Result<(), StoreError> {
        self.state
            .update(|states: &mut FeedStateMap| {
                let state = states.entry(feed_id.to_owned()).or_default();
                state.status_code = Some(status);
                state.last_checked = Some(checked_at);
                if last_post.is_some() {
                    state.last_post = last_post;
                }
            })
            .await
    }

    pub async fn export_config(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(self.feeds.read_bytes().await?)
    }

    /// Restores a config backup byte for byte after checking it has `FEEDS`.
    pub async fn import_config(&self, bytes: &[u8]) -> Result<usize, ConfigError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ConfigError::InvalidBackup(e.to_string()))?;
        if value.get("FEEDS").is_none() {
            return Err(ConfigError::InvalidBackup(
                "'FEEDS' key is missing".to_owned(),
            ));
        }
        let parsed: ConfigFile = serde_json::from_value(value)
            .map_err(|e| ConfigError::InvalidBackup(e.to_string()))?;
        for feed in &parsed.feeds {
            if let Err(e) = validate_feed(feed) {
                warn!(feed = %feed.id, error = %e, "restored feed has an invalid url");
            }
        }
        self.feeds.replace_bytes(bytes).await?;
        info!(feeds = parsed.feeds.len(), "feed config restored");
        Ok(parsed.feeds.len())
    }
}
