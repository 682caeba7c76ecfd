use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::data::DataApi;
use crate::dispatch::{build_embed, redact, Dispatcher, Outcome};
use crate::error::CheckError;
use crate::feed::{CheckStatus, Feed, FeedStateMap, LastPost};
use crate::fetcher::FeedFetcher;
use crate::policy;

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub reconcile_interval: Duration,
    pub startup_stagger: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            startup_stagger: Duration::from_secs(2),
        }
    }
}

impl From<&AppConfig> for PollConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            reconcile_interval: config.scheduler.reconcile_interval(),
            startup_stagger: config.scheduler.startup_stagger(),
        }
    }
}

/// One dispatch attempt during a check.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub webhook_url: String,
    pub article_id: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub feed_id: String,
    pub status: CheckStatus,
    pub seeded: usize,
    pub deliveries: Vec<Delivery>,
}

impl CheckReport {
    pub fn last_post(&self) -> Option<&Outcome> {
        self.deliveries.last().map(|d| &d.outcome)
    }
}

/// Runs check cycles: fetch, filter per destination, dispatch, record.
#[derive(Debug, Clone)]
pub struct Checker {
    data: DataApi,
    fetcher: FeedFetcher,
    dispatcher: Dispatcher,
    window: chrono::Duration,
}

impl Checker {
    pub fn new(
        data: DataApi,
        fetcher: FeedFetcher,
        dispatcher: Dispatcher,
        window: chrono::Duration,
    ) -> Self {
        Self {
            data,
            fetcher,
            dispatcher,
            window,
        }
    }

    pub fn from_config(data: DataApi, config: &AppConfig) -> reqwest::Result<Self> {
        let client = config.http.build_client()?;
        Ok(Self::new(
            data,
            FeedFetcher::new(client.clone(), config.http.fetch_timeout())
                .with_max_body(config.http.max_feed_bytes),
            Dispatcher::new(client, config.http.webhook_timeout()),
            config.scheduler.window(),
        ))
    }

    pub fn data(&self) -> &DataApi {
        &self.data
    }

    /// Force check from outside the scheduler; ignores the pause flag.
    pub async fn check_feed_by_id(&self, feed_id: &str) -> Result<CheckReport, CheckError> {
        let feed = self
            .data
            .list_feeds()
            .await?
            .into_iter()
            .find(|f| f.id == feed_id)
            .ok_or_else(|| CheckError::FeedNotFound(feed_id.to_owned()))?;
        self.check_feed(&feed).await
    }

    /// One full cycle for `feed`. Failures are written to the feed's status
    /// before being returned.
    pub async fn check_feed(&self, feed: &Feed) -> Result<CheckReport, CheckError> {
        match self.run_cycle(feed).await {
            Ok(report) => Ok(report),
            Err(err) => {
                let status = match &err {
                    CheckError::Store(e) if e.is_busy() => CheckStatus::StoreBusy,
                    other => CheckStatus::Error(other.to_string()),
                };
                self.record_failure(&feed.id, status).await;
                Err(err)
            }
        }
    }

    pub async fn record_failure(&self, feed_id: &str, status: CheckStatus) {
        if let Err(e) = self.data.record_check(feed_id, status, Utc::now(), None).await {
            warn!(feed = %feed_id, error = %e, "failed to record check status");
        }
    }

    async fn run_cycle(&self, feed: &Feed) -> Result<CheckReport, CheckError> {
        let now = Utc::now();
        let fetched = self.fetcher.fetch(&feed.url).await;
        let mut report = CheckReport {
            feed_id: feed.id.clone(),
            status: fetched.status.clone(),
            seeded: 0,
            deliveries: Vec::new(),
        };

        if !fetched.status.is_ok() {
            self.data
                .record_check(&feed.id, fetched.status, now, None)
                .await?;
            return Ok(report);
        }

        let recent = policy::within_window(fetched.articles, now, self.window);
        if recent.is_empty() {
            debug!(feed = %feed.id, "no articles inside the window");
        }

        let sent = self.data.sent_store();
        let snapshot = sent.load().await?;
        for hook in feed.destinations() {
            let plan = policy::plan(&feed.id, &hook.url, &recent, &snapshot);
            if plan.first_check && !plan.is_empty() {
                info!(
                    feed = %feed.id,
                    webhook = %redact(&hook.url),
                    seeded = plan.seed.len(),
                    "first check for destination, posting newest article only"
                );
            }
            if !plan.seed.is_empty() {
                report.seeded += sent.seed(&feed.id, &hook.url, plan.seed).await?;
            }
            for article in plan.send {
                let embed = build_embed(&article, feed.display_name());
                let outcome = self.dispatcher.send(&hook.url, &embed).await;
                // recorded whatever the outcome so a failing destination is not retried forever
                sent.mark_sent(&feed.id, &hook.url, &article.identifier).await?;
                let rate_limited = matches!(outcome, Outcome::RateLimited { .. });
                if rate_limited {
                    warn!(
                        feed = %feed.id,
                        webhook = %redact(&hook.url),
                        retry_after_ms = outcome.retry_after().map(|d| d.as_millis() as u64),
                        "rate limited, deferring remaining articles to the next check"
                    );
                }
                report.deliveries.push(Delivery {
                    webhook_url: hook.url.clone(),
                    article_id: article.identifier,
                    outcome,
                });
                if rate_limited {
                    break;
                }
            }
        }

        let last_post = report.last_post().cloned().map(|status| LastPost {
            status,
            timestamp: Utc::now(),
        });
        self.data
            .record_check(&feed.id, report.status.clone(), now, last_post)
            .await?;
        if !report.deliveries.is_empty() {
            info!(feed = %feed.id, sent = report.deliveries.len(), "posted new articles");
        }
        Ok(report)
    }
}

/// Observable per-feed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedPhase {
    Idle,
    Checking,
    Sleeping,
    Paused,
}

enum Command {
    ForceCheck {
        feed_id: String,
        reply: oneshot::Sender<Result<(), CheckError>>,
    },
    Reload,
    Phases {
        reply: oneshot::Sender<Vec<(String, FeedPhase)>>,
    },
}

pub struct PollerHandle {
    cancel_tx: broadcast::Sender<()>,
    commands: mpsc::Sender<Command>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// Stops every feed task at its next check boundary and waits for them.
    pub async fn stop(self) -> Result<(), CheckError> {
        let _ = self.cancel_tx.send(());
        self.join.await.map_err(CheckError::from)
    }

    /// Runs a check for the feed now, outside its timer and even when paused.
    pub async fn force_check(&self, feed_id: &str) -> Result<(), CheckError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ForceCheck {
                feed_id: feed_id.to_owned(),
                reply,
            })
            .await
            .map_err(|_| CheckError::SchedulerStopped)?;
        rx.await.map_err(|_| CheckError::SchedulerStopped)?
    }

    /// Re-reads the feed config without waiting for the reconcile timer.
    pub async fn reload(&self) -> Result<(), CheckError> {
        self.commands
            .send(Command::Reload)
            .await
            .map_err(|_| CheckError::SchedulerStopped)
    }

    pub async fn phases(&self) -> Result<Vec<(String, FeedPhase)>, CheckError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Phases { reply })
            .await
            .map_err(|_| CheckError::SchedulerStopped)?;
        rx.await.map_err(|_| CheckError::SchedulerStopped)
    }
}

struct FeedTask {
    config_tx: watch::Sender<Option<Feed>>,
    trigger_tx: mpsc::Sender<()>,
    phase_rx: watch::Receiver<FeedPhase>,
    join: JoinHandle<()>,
}

pub fn spawn_poller(checker: Arc<Checker>, config: PollConfig) -> PollerHandle {
    let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
    let (commands, mut command_rx) = mpsc::channel(16);
    let join = tokio::spawn(async move {
        let mut tasks: HashMap<String, FeedTask> = HashMap::new();
        let mut ticker = tokio::time::interval(config.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("scheduler started");

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    info!("scheduler shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    reconcile(&checker, &config, &mut tasks).await;
                }
                Some(command) = command_rx.recv() => match command {
                    Command::ForceCheck { feed_id, reply } => {
                        let result = match tasks.get(&feed_id) {
                            Some(task) => {
                                // a full channel means a check is already queued
                                let _ = task.trigger_tx.try_send(());
                                Ok(())
                            }
                            None => Err(CheckError::FeedNotFound(feed_id)),
                        };
                        let _ = reply.send(result);
                    }
                    Command::Reload => reconcile(&checker, &config, &mut tasks).await,
                    Command::Phases { reply } => {
                        let mut phases: Vec<(String, FeedPhase)> = tasks
                            .iter()
                            .map(|(id, task)| (id.clone(), *task.phase_rx.borrow()))
                            .collect();
                        phases.sort_by(|a, b| a.0.cmp(&b.0));
                        let _ = reply.send(phases);
                    }
                }
            }
        }

        for (_, task) in tasks.drain() {
            task.config_tx.send_replace(None);
            if let Err(e) = task.join.await {
                warn!(error = %e, "feed task ended abnormally");
            }
        }
        info!("scheduler stopped");
    });

    PollerHandle {
        cancel_tx,
        commands,
        join,
    }
}

async fn reconcile(checker: &Arc<Checker>, config: &PollConfig, tasks: &mut HashMap<String, FeedTask>) {
    let feeds = match checker.data().list_feeds().await {
        Ok(feeds) => feeds,
        Err(e) => {
            warn!(error = %e, "failed to read feed config, keeping current schedule");
            return;
        }
    };
    let states = checker.data().feed_states().await.unwrap_or_else(|e| {
        warn!(error = %e, "failed to read feed state");
        FeedStateMap::new()
    });

    tasks.retain(|id, task| {
        if task.join.is_finished() {
            warn!(feed = %id, "feed task exited, respawning");
            false
        } else {
            true
        }
    });

    let mut spawned = 0u32;
    for feed in &feeds {
        if feed.id.is_empty() {
            continue;
        }
        if let Some(task) = tasks.get(&feed.id) {
            if task.config_tx.borrow().as_ref() != Some(feed) {
                debug!(feed = %feed.id, "feed config changed");
                task.config_tx.send_replace(Some(feed.clone()));
            }
            continue;
        }

        let last_checked = states.get(&feed.id).and_then(|s| s.last_checked);
        let delay = remaining_interval(last_checked, feed.interval()) + config.startup_stagger * spawned;
        spawned += 1;
        tasks.insert(feed.id.clone(), spawn_feed_task(checker.clone(), feed.clone(), delay));
        debug!(feed = %feed.id, delay_ms = delay.as_millis() as u64, "feed scheduled");
    }

    let removed: Vec<String> = tasks
        .keys()
        .filter(|id| !feeds.iter().any(|f| &f.id == *id))
        .cloned()
        .collect();
    for id in removed {
        if let Some(task) = tasks.remove(&id) {
            // the task exits at its next check boundary
            task.config_tx.send_replace(None);
        }
        match checker.data().sent_store().forget_feed(&id).await {
            Ok(n) => info!(feed = %id, forgotten = n, "feed removed from schedule"),
            Err(e) => warn!(feed = %id, error = %e, "failed to forget sent records"),
        }
    }
}

/// Time left until a feed is due again, zero when it was never checked or is overdue.
fn remaining_interval(last_checked: Option<chrono::DateTime<Utc>>, interval: Duration) -> Duration {
    let Some(at) = last_checked else {
        return Duration::ZERO;
    };
    let Ok(interval) = chrono::Duration::from_std(interval) else {
        return Duration::ZERO;
    };
    (at + interval - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

fn spawn_feed_task(checker: Arc<Checker>, feed: Feed, initial_delay: Duration) -> FeedTask {
    let (config_tx, config_rx) = watch::channel(Some(feed));
    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    let (phase_tx, phase_rx) = watch::channel(FeedPhase::Idle);
    let join = tokio::spawn(run_feed(checker, config_rx, trigger_rx, phase_tx, initial_delay));
    FeedTask {
        config_tx,
        trigger_tx,
        phase_rx,
        join,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn run_feed(
    checker: Arc<Checker>,
    mut config_rx: watch::Receiver<Option<Feed>>,
    mut trigger_rx: mpsc::Receiver<()>,
    phase_tx: watch::Sender<FeedPhase>,
    initial_delay: Duration,
) {
    let mut next: Option<Instant> = Some(Instant::now() + initial_delay);
    let mut last_done: Option<Instant> = None;

    loop {
        let forced = tokio::select! {
            _ = sleep_until(next) => false,
            trigger = trigger_rx.recv() => match trigger {
                Some(()) => true,
                None => return,
            },
            changed = config_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let interval = match config_rx.borrow().as_ref() {
                    Some(feed) => feed.interval(),
                    None => return,
                };
                // interval or pause flag may have changed
                next = match last_done {
                    Some(at) => Some(at + interval),
                    None => next.or_else(|| Some(Instant::now())),
                };
                continue;
            }
        };

        let Some(feed) = config_rx.borrow_and_update().clone() else {
            return;
        };
        if feed.is_paused() && !forced {
            debug!(feed = %feed.id, "feed paused, skipping");
            phase_tx.send_replace(FeedPhase::Paused);
            next = None;
            continue;
        }

        phase_tx.send_replace(FeedPhase::Checking);
        run_guarded(&checker, &feed).await;
        let done = Instant::now();
        last_done = Some(done);

        if feed.is_paused() {
            phase_tx.send_replace(FeedPhase::Paused);
            next = None;
        } else {
            phase_tx.send_replace(FeedPhase::Sleeping);
            next = Some(done + feed.interval());
        }
    }
}

// A failing or panicking cycle is contained here; the feed keeps its timer.
async fn run_guarded(checker: &Checker, feed: &Feed) {
    match AssertUnwindSafe(checker.check_feed(feed)).catch_unwind().await {
        Ok(Ok(report)) => debug!(
            feed = %feed.id,
            status = %report.status,
            sent = report.deliveries.len(),
            seeded = report.seeded,
            "check finished"
        ),
        Ok(Err(e)) => warn!(feed = %feed.id, error = %e, "check failed"),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            error!(feed = %feed.id, %reason, "check panicked");
            checker
                .record_failure(&feed.id, CheckStatus::Error(format!("panic: {reason}")))
                .await;
        }
    }
}
