use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{redirect, Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fetcher::DEFAULT_MAX_BODY_BYTES;
use crate::storage::{PruneScope, DEFAULT_SENT_CAP};

// Some feed hosts refuse obvious bot agents.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/116.0";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub http: HttpConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often `config.json` is re-read for added, edited or deleted feeds.
    pub reconcile_interval_seconds: u64,
    pub window_hours: u64,
    /// Delay between the first checks of consecutive feeds at startup.
    pub startup_stagger_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub fetch_timeout_seconds: u64,
    pub webhook_timeout_seconds: u64,
    pub user_agent: String,
    pub max_redirects: usize,
    pub max_feed_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub sent_cap: usize,
    pub prune_scope: PruneScope,
    pub lock_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_seconds: 30,
            window_hours: 24,
            startup_stagger_ms: 2_000,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_seconds: 20,
            webhook_timeout_seconds: 10,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            max_redirects: 5,
            max_feed_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sent_cap: DEFAULT_SENT_CAP,
            prune_scope: PruneScope::Global,
            lock_timeout_ms: 5_000,
        }
    }
}

impl SchedulerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds.max(1))
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.window_hours.max(1) as i64)
    }

    pub fn startup_stagger(&self) -> Duration {
        Duration::from_millis(self.startup_stagger_ms)
    }
}

impl HttpConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds.max(1))
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_seconds.max(1))
    }

    pub fn build_client(&self) -> reqwest::Result<Client> {
        ClientBuilder::new()
            .redirect(redirect::Policy::limited(self.max_redirects))
            .user_agent(self.user_agent.clone())
            .build()
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Files kept in the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$XDG_CONFIG_HOME/feedhook` (or the platform equivalent), else `./feedhook`.
    pub fn default_location() -> Self {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("feedhook"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    pub fn feeds(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn sent_articles(&self) -> PathBuf {
        self.root.join("sent_articles.json")
    }

    pub fn feed_state(&self) -> PathBuf {
        self.root.join("feed_state.json")
    }

    pub fn users(&self) -> PathBuf {
        self.root.join("users.json")
    }
}

impl AppConfig {
    /// Loads `settings.json`. A missing file is created with the defaults; an
    /// unreadable one is reported and the defaults are used without touching it.
    pub fn load(dir: &DataDir) -> Self {
        let path = dir.settings();
        match Self::load_from_file(&path) {
            Ok(config) => config,
            Err(e) if is_not_found(e.as_ref()) => {
                let default_config = Self::default();
                if let Err(save_err) = default_config.save(&path) {
                    warn!(error = %save_err, path = %path.display(), "failed to write default settings");
                }
                default_config
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to load settings, using defaults");
                Self::default()
            }
        }
    }

    fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn is_not_found(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
}
