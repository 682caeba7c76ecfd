//! Which fetched articles go to which destination.
//!
//! Articles older than the rolling window are never sent. Articles without a
//! timestamp cannot be excluded on recency and always pass the window. History
//! is kept per (feed, webhook) pair: a pair with no history gets the "first
//! check" treatment, sending only its newest article and seeding the rest.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::feed::Article;
use crate::storage::SentSnapshot;

pub fn default_window() -> Duration {
    Duration::hours(24)
}

/// Articles published at or after `now - window`, in feed order, with repeated
/// identifiers collapsed to their first occurrence.
pub fn within_window<I>(articles: I, now: DateTime<Utc>, window: Duration) -> Vec<Article>
where
    I: IntoIterator<Item = Article>,
{
    let cutoff = now - window;
    let mut seen = HashSet::new();
    articles
        .into_iter()
        .filter(|a| a.published_at.map_or(true, |at| at >= cutoff))
        .filter(|a| seen.insert(a.identifier.clone()))
        .collect()
}

/// Decision for one destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// Articles to dispatch, oldest first.
    pub send: Vec<Article>,
    /// Identifiers to record without dispatching.
    pub seed: Vec<String>,
    pub first_check: bool,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.send.is_empty() && self.seed.is_empty()
    }
}

// Newest first: dated before undated, later timestamp first, then feed order.
fn newest_first(recent: &[Article]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..recent.len()).collect();
    order.sort_by(|&a, &b| match recent[b].published_at.cmp(&recent[a].published_at) {
        Ordering::Equal => a.cmp(&b),
        other => other,
    });
    order
}

pub fn plan(
    feed_id: &str,
    webhook_url: &str,
    recent: &[Article],
    snapshot: &SentSnapshot,
) -> Plan {
    let order = newest_first(recent);

    if !snapshot.has_history(feed_id, webhook_url) {
        let mut indices = order.into_iter();
        let send = indices
            .next()
            .map(|idx| vec![recent[idx].clone()])
            .unwrap_or_default();
        let seed = indices.map(|idx| recent[idx].identifier.clone()).collect();
        return Plan {
            send,
            seed,
            first_check: true,
        };
    }

    let send = order
        .into_iter()
        .rev()
        .map(|idx| &recent[idx])
        .filter(|a| !snapshot.has_sent(feed_id, webhook_url, &a.identifier))
        .cloned()
        .collect();
    Plan {
        send,
        seed: Vec::new(),
        first_check: false,
    }
}
