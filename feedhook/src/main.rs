use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use feedhook_core::{
    spawn_poller, AppConfig, Checker, DataApi, DataDir, Feed, PollConfig, Role, UserStore, Webhook,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding config.json, sent_articles.json and friends.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until interrupted.
    Run,
    /// Check one feed now, even when paused.
    Check { feed_id: String },
    /// Last check result of every feed.
    Status {
        #[arg(long)]
        json: bool,
    },
    #[command(subcommand)]
    Feeds(FeedCommands),
    #[command(subcommand)]
    Webhooks(WebhookCommands),
    #[command(subcommand)]
    Users(UserCommands),
    /// Write a backup of the feed config or user database.
    Backup { kind: BackupKind, file: PathBuf },
    /// Replace the feed config or user database from a backup.
    Restore { kind: BackupKind, file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum FeedCommands {
    List,
    Add {
        url: String,
        #[arg(long, default_value = "")]
        name: String,
        /// Seconds between checks.
        #[arg(long, default_value_t = 300)]
        interval: u64,
        /// Discord webhook url; repeat for several destinations.
        #[arg(long = "webhook", required = true)]
        webhooks: Vec<String>,
    },
    Remove { feed_id: String },
    Pause { feed_id: String },
    Resume { feed_id: String },
}

#[derive(Subcommand, Debug)]
enum WebhookCommands {
    Add {
        feed_id: String,
        url: String,
        #[arg(long, default_value = "")]
        label: String,
    },
    Remove { feed_id: String, url: String },
}

#[derive(Subcommand, Debug)]
enum UserCommands {
    List,
    /// Create the owner account on a fresh install.
    Setup { username: String, password: String },
    Add {
        username: String,
        password: String,
        #[arg(long, value_enum, default_value_t = CliRole::Admin)]
        role: CliRole,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackupKind {
    Config,
    Users,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CliRole {
    Admin,
    SuperAdmin,
}

impl From<CliRole> for Role {
    fn from(role: CliRole) -> Self {
        match role {
            CliRole::Admin => Role::Admin,
            CliRole::SuperAdmin => Role::SuperAdmin,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let dir = cli
        .data_dir
        .map(DataDir::new)
        .unwrap_or_else(DataDir::default_location);
    std::fs::create_dir_all(dir.root())
        .with_context(|| format!("failed to create {}", dir.root().display()))?;
    let config = AppConfig::load(&dir);
    let data = DataApi::open(&dir, &config);
    let users = UserStore::open(dir.users(), config.store.lock_timeout());

    match cli.command {
        Commands::Run => run(data, &config).await,
        Commands::Check { feed_id } => {
            let checker = Checker::from_config(data, &config)?;
            let report = checker.check_feed_by_id(&feed_id).await?;
            println!(
                "{}: status {}, {} posted, {} seeded",
                report.feed_id,
                report.status,
                report.deliveries.len(),
                report.seeded
            );
            for delivery in &report.deliveries {
                println!("  {} -> {}", delivery.article_id, delivery.outcome);
            }
            Ok(())
        }
        Commands::Status { json } => status(&data, json).await,
        Commands::Feeds(command) => feeds(&data, command).await,
        Commands::Webhooks(command) => webhooks(&data, command).await,
        Commands::Users(command) => users_command(&users, command).await,
        Commands::Backup { kind, file } => {
            let bytes = match kind {
                BackupKind::Config => data.export_config().await?,
                BackupKind::Users => users.export().await?,
            };
            if bytes.is_empty() {
                bail!("nothing to back up yet");
            }
            tokio::fs::write(&file, bytes)
                .await
                .with_context(|| format!("failed to write {}", file.display()))?;
            info!(path = %file.display(), ?kind, "backup written");
            Ok(())
        }
        Commands::Restore { kind, file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let count = match kind {
                BackupKind::Config => data.import_config(&bytes).await?,
                BackupKind::Users => users.import(&bytes).await?,
            };
            println!("restored {count} entries");
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn run(data: DataApi, config: &AppConfig) -> Result<()> {
    data.init_files().await?;
    let checker = Checker::from_config(data, config).context("failed to build HTTP client")?;
    let poller = spawn_poller(Arc::new(checker), PollConfig::from(config));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("interrupt received, finishing in-flight checks");
    poller.stop().await?;
    Ok(())
}

async fn status(data: &DataApi, json: bool) -> Result<()> {
    let feeds = data.list_feeds().await?;
    let states = data.feed_states().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&states)?);
        return Ok(());
    }
    for feed in &feeds {
        let state = states.get(&feed.id).cloned().unwrap_or_default();
        let checked = state
            .last_checked
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_owned());
        let status = state
            .status_code
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_owned());
        let last_post = state
            .last_post
            .map(|p| format!("{} at {}", p.status, p.timestamp.to_rfc3339()))
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "{}  {}{}\n    checked: {checked}  status: {status}  last post: {last_post}",
            feed.id,
            feed.display_name(),
            if feed.is_paused() { " (paused)" } else { "" },
        );
    }
    Ok(())
}

async fn feeds(data: &DataApi, command: FeedCommands) -> Result<()> {
    match command {
        FeedCommands::List => {
            for feed in data.list_feeds().await? {
                println!(
                    "{}  {}  every {}s{}",
                    feed.id,
                    feed.url,
                    feed.interval().as_secs(),
                    if feed.is_paused() { "  paused" } else { "" }
                );
                for hook in feed.destinations() {
                    println!("    -> {}", feedhook_core::dispatch::redact(&hook.url));
                }
            }
        }
        FeedCommands::Add {
            url,
            name,
            interval,
            webhooks,
        } => {
            let hooks = webhooks.into_iter().map(|u| Webhook::new(u, "")).collect();
            let mut feed = Feed::new(name, url, hooks);
            feed.update_interval = interval;
            let feed = data.add_feed(feed).await?;
            println!("{}", feed.id);
        }
        FeedCommands::Remove { feed_id } => {
            data.delete_feed(&feed_id).await?;
        }
        FeedCommands::Pause { feed_id } => {
            data.set_paused(&feed_id, true).await?;
        }
        FeedCommands::Resume { feed_id } => {
            data.set_paused(&feed_id, false).await?;
        }
    }
    Ok(())
}

async fn webhooks(data: &DataApi, command: WebhookCommands) -> Result<()> {
    match command {
        WebhookCommands::Add { feed_id, url, label } => {
            data.add_webhook(&feed_id, Webhook::new(url, label)).await?;
        }
        WebhookCommands::Remove { feed_id, url } => {
            data.remove_webhook(&feed_id, &url).await?;
        }
    }
    Ok(())
}

async fn users_command(users: &UserStore, command: UserCommands) -> Result<()> {
    match command {
        UserCommands::List => {
            for user in users.list().await? {
                println!("{}  {}  {}", user.id, user.username, user.role);
            }
        }
        UserCommands::Setup { username, password } => {
            users.setup_owner(&username, &password).await?;
        }
        UserCommands::Add {
            username,
            password,
            role,
        } => {
            users.add_user(&username, &password, role.into()).await?;
        }
    }
    Ok(())
}
