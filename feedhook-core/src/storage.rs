use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::persist::LockedJsonFile;

pub const DEFAULT_SENT_CAP: usize = 10_000;
const FORMAT_VERSION: u32 = 1;

/// How the sent-record cap is applied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PruneScope {
    /// One cap over the whole file.
    #[default]
    Global,
    /// The cap applies to each (feed, webhook) pair separately.
    PerPair,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SentRecord {
    pub feed_id: String,
    pub webhook_url: String,
    pub id: String,
}

impl SentRecord {
    fn is_pair(&self, feed_id: &str, webhook_url: &str) -> bool {
        self.feed_id == feed_id && self.webhook_url == webhook_url
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentData {
    #[serde(default)]
    pub version: u32,
    // insertion order, oldest first
    #[serde(default)]
    pub entries: Vec<SentRecord>,
}

impl Default for SentData {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            entries: Vec::new(),
        }
    }
}

impl SentData {
    /// Appends the ids not yet recorded for the pair; returns how many were new.
    fn insert_many<I>(&mut self, feed_id: &str, webhook_url: &str, ids: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut known: HashSet<String> = self
            .entries
            .iter()
            .filter(|r| r.is_pair(feed_id, webhook_url))
            .map(|r| r.id.clone())
            .collect();
        let mut added = 0;
        for id in ids {
            if known.insert(id.clone()) {
                self.entries.push(SentRecord {
                    feed_id: feed_id.to_owned(),
                    webhook_url: webhook_url.to_owned(),
                    id,
                });
                added += 1;
            }
        }
        added
    }

    /// Evicts oldest entries until the cap holds; returns how many were dropped.
    fn prune(&mut self, cap: usize, scope: PruneScope) -> usize {
        let before = self.entries.len();
        match scope {
            PruneScope::Global => {
                if before > cap {
                    self.entries.drain(..before - cap);
                }
            }
            PruneScope::PerPair => {
                let mut seen: HashMap<(&str, &str), usize> = HashMap::new();
                let mut keep = vec![false; before];
                for (idx, record) in self.entries.iter().enumerate().rev() {
                    let count = seen
                        .entry((record.feed_id.as_str(), record.webhook_url.as_str()))
                        .or_default();
                    if *count < cap {
                        *count += 1;
                        keep[idx] = true;
                    }
                }
                let mut flags = keep.into_iter();
                self.entries.retain(|_| flags.next().unwrap_or(false));
            }
        }
        self.version = FORMAT_VERSION;
        before - self.entries.len()
    }
}

#[derive(Debug, Default)]
struct PairHistory {
    order: Vec<String>,
    members: HashSet<String>,
}

/// Point-in-time view of the store: (feed_id, webhook_url) -> ordered id set.
#[derive(Debug, Default)]
pub struct SentSnapshot {
    pairs: HashMap<(String, String), PairHistory>,
    total: usize,
}

impl From<SentData> for SentSnapshot {
    fn from(data: SentData) -> Self {
        let mut snapshot = SentSnapshot::default();
        for record in data.entries {
            let pair = snapshot
                .pairs
                .entry((record.feed_id, record.webhook_url))
                .or_default();
            if pair.members.insert(record.id.clone()) {
                pair.order.push(record.id);
                snapshot.total += 1;
            }
        }
        snapshot
    }
}

impl SentSnapshot {
    fn pair(&self, feed_id: &str, webhook_url: &str) -> Option<&PairHistory> {
        self.pairs
            .get(&(feed_id.to_owned(), webhook_url.to_owned()))
    }

    pub fn has_sent(&self, feed_id: &str, webhook_url: &str, id: &str) -> bool {
        self.pair(feed_id, webhook_url)
            .is_some_and(|p| p.members.contains(id))
    }

    /// False until anything was recorded for the pair; drives the first check.
    pub fn has_history(&self, feed_id: &str, webhook_url: &str) -> bool {
        self.pair(feed_id, webhook_url)
            .is_some_and(|p| !p.order.is_empty())
    }

    /// Ids recorded for the pair, oldest first.
    pub fn history(&self, feed_id: &str, webhook_url: &str) -> &[String] {
        self.pair(feed_id, webhook_url)
            .map(|p| p.order.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Durable dedup memory shared by the scheduler and the dashboard.
#[derive(Debug, Clone)]
pub struct SentStore {
    file: LockedJsonFile,
    cap: usize,
    scope: PruneScope,
}

impl SentStore {
    pub fn open(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            file: LockedJsonFile::new(path, lock_timeout),
            cap: DEFAULT_SENT_CAP,
            scope: PruneScope::Global,
        }
    }

    pub fn with_cap(mut self, cap: usize, scope: PruneScope) -> Self {
        self.cap = cap.max(1);
        self.scope = scope;
        self
    }

    pub fn file(&self) -> &LockedJsonFile {
        &self.file
    }

    pub async fn load(&self) -> Result<SentSnapshot, StoreError> {
        let data: SentData = self.file.read().await?;
        Ok(SentSnapshot::from(data))
    }

    pub async fn has_sent(
        &self,
        feed_id: &str,
        webhook_url: &str,
        id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.load().await?.has_sent(feed_id, webhook_url, id))
    }

    /// Records one dispatched article. Returns false if it was already known.
    pub async fn mark_sent(
        &self,
        feed_id: &str,
        webhook_url: &str,
        id: &str,
    ) -> Result<bool, StoreError> {
        let (cap, scope) = (self.cap, self.scope);
        self.file
            .update(|data: &mut SentData| {
                let added = data.insert_many(feed_id, webhook_url, [id.to_owned()]);
                data.prune(cap, scope);
                added == 1
            })
            .await
    }

    /// Records articles as sent without dispatching them.
    pub async fn seed<I>(&self, feed_id: &str, webhook_url: &str, ids: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = String>,
    {
        let (cap, scope) = (self.cap, self.scope);
        let added = self
            .file
            .update(|data: &mut SentData| {
                let added = data.insert_many(feed_id, webhook_url, ids);
                data.prune(cap, scope);
                added
            })
            .await?;
        debug!(feed = %feed_id, added, "seeded sent store");
        Ok(added)
    }

    pub async fn prune(&self) -> Result<usize, StoreError> {
        let (cap, scope) = (self.cap, self.scope);
        let evicted = self
            .file
            .update(|data: &mut SentData| data.prune(cap, scope))
            .await?;
        if evicted > 0 {
            info!(evicted, cap, "pruned sent store");
        }
        Ok(evicted)
    }

    pub async fn forget_feed(&self, feed_id: &str) -> Result<usize, StoreError> {
        self.file
            .update(|data: &mut SentData| {
                let before = data.entries.len();
                data.entries.retain(|r| r.feed_id != feed_id);
                before - data.entries.len()
            })
            .await
    }

    pub async fn forget_webhook(&self, feed_id: &str, webhook_url: &str) -> Result<usize, StoreError> {
        self.file
            .update(|data: &mut SentData| {
                let before = data.entries.len();
                data.entries.retain(|r| !r.is_pair(feed_id, webhook_url));
                before - data.entries.len()
            })
            .await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        let data: SentData = self.file.read().await?;
        Ok(data.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("id-{i}")).collect()
    }

    #[test]
    fn insert_keeps_pairs_independent() {
        let mut data = SentData::default();
        assert_eq!(data.insert_many("f", "a", ids(0..3)), 3);
        assert_eq!(data.insert_many("f", "a", ids(2..4)), 1);
        assert_eq!(data.insert_many("f", "b", ids(0..2)), 2);
        let snap = SentSnapshot::from(data);
        assert_eq!(snap.history("f", "a"), ids(0..4).as_slice());
        assert!(snap.has_sent("f", "b", "id-1"));
        assert!(!snap.has_sent("f", "b", "id-2"));
        assert!(!snap.has_history("g", "a"));
    }

    #[test]
    fn global_prune_evicts_oldest_across_pairs() {
        let mut data = SentData::default();
        data.insert_many("f", "a", ids(0..4));
        data.insert_many("f", "b", ids(4..8));
        assert_eq!(data.prune(5, PruneScope::Global), 3);
        let snap = SentSnapshot::from(data);
        assert_eq!(snap.history("f", "a"), &["id-3".to_string()]);
        assert_eq!(snap.history("f", "b").len(), 4);
    }

    #[test]
    fn per_pair_prune_caps_each_pair() {
        let mut data = SentData::default();
        data.insert_many("f", "a", ids(0..4));
        data.insert_many("f", "b", ids(4..6));
        assert_eq!(data.prune(3, PruneScope::PerPair), 1);
        let snap = SentSnapshot::from(data);
        assert_eq!(snap.history("f", "a"), ids(1..4).as_slice());
        assert_eq!(snap.history("f", "b"), ids(4..6).as_slice());
    }
}
