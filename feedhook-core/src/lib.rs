pub mod config;
pub mod data;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod fetcher;
pub mod persist;
pub mod policy;
pub mod poller;
pub mod storage;
pub mod users;

pub use config::{AppConfig, DataDir};
pub use data::DataApi;
pub use dispatch::{build_embed, Dispatcher, Outcome};
pub use error::{CheckError, ConfigError, StoreError, UserError};
pub use feed::{Article, CheckStatus, ConfigFile, Feed, FeedState, LastPost, Webhook};
pub use fetcher::{Articles, FeedFetcher, FetchResult};
pub use persist::LockedJsonFile;
pub use policy::Plan;
pub use poller::{spawn_poller, CheckReport, Checker, Delivery, FeedPhase, PollConfig, PollerHandle};
pub use storage::{PruneScope, SentSnapshot, SentStore};
pub use users::{Role, User, UserStore};
