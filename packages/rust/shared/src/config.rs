//! Application configuration for storysync.
//!
//! User config lives at `~/.storysync/storysync.toml`.
//! CLI flags and env vars override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorySyncError};
use crate::profile::SourceProfile;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "storysync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".storysync";

/// Upper bound on `fetch.max_attempts`.
pub const MAX_FETCH_ATTEMPTS: u32 = 20;

// ---------------------------------------------------------------------------
// Config structs (matching storysync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Catalog source.
    #[serde(default)]
    pub source: SourceConfig,

    /// Fetch pool and retry policy.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Per-run budget.
    #[serde(default)]
    pub run: RunPolicyConfig,

    /// Local durable state.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Downstream sink.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Structural queries for the source markup.
    #[serde(default)]
    pub profile: SourceProfile,
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source origin; relative priority entries resolve against it.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Listing URL templates; `{page}` is replaced by the page number.
    /// Templates without the placeholder are fetched once.
    #[serde(default)]
    pub listing_templates: Vec<String>,

    /// First page number substituted into templates.
    #[serde(default = "default_first_page")]
    pub first_page: u32,

    /// Maximum number of pages scanned per template.
    #[serde(default = "default_max_listing_pages")]
    pub max_listing_pages: u32,

    /// Stop discovery once this many entries are known.
    #[serde(default)]
    pub max_catalog_entries: Option<usize>,

    /// Entry URLs processed ahead of discovered ones.
    #[serde(default)]
    pub priority_entries: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            listing_templates: Vec::new(),
            first_page: default_first_page(),
            max_listing_pages: default_max_listing_pages(),
            max_catalog_entries: None,
            priority_entries: Vec::new(),
        }
    }
}

fn default_first_page() -> u32 {
    1
}
fn default_max_listing_pages() -> u32 {
    20
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Worker-pool size W: concurrent unit fetches system-wide.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Entity parallelism E.
    #[serde(default = "default_entity_parallelism")]
    pub entity_parallelism: usize,

    /// Per-fetch timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Total attempts per fetch, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Growth factor between retries.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on a single retry delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Politeness delay before each worker fetch.
    #[serde(default)]
    pub rate_limit_ms: u64,

    /// Consecutive empty probes (K) that end numeric probing.
    #[serde(default = "default_probe_miss_limit")]
    pub probe_miss_limit: u32,

    /// User-Agent header sent to the source.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            entity_parallelism: default_entity_parallelism(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_backoff_max_ms(),
            rate_limit_ms: 0,
            probe_miss_limit: default_probe_miss_limit(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_workers() -> usize {
    5
}
fn default_entity_parallelism() -> usize {
    2
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_probe_miss_limit() -> u32 {
    3
}
fn default_user_agent() -> String {
    concat!("storysync/", env!("CARGO_PKG_VERSION")).into()
}

/// `[run]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPolicyConfig {
    /// Maximum entities started per run.
    #[serde(default)]
    pub max_entities_per_run: Option<usize>,

    /// Stop starting new entities after this many seconds.
    #[serde(default)]
    pub deadline_secs: Option<u64>,

    /// Publish after every N updated entities (in addition to the end of run).
    #[serde(default)]
    pub publish_every: Option<usize>,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Snapshot file (the store).
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,

    /// libSQL database holding progress, run history, and publish state.
    #[serde(default = "default_state_db")]
    pub state_db: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            state_db: default_state_db(),
        }
    }
}

fn default_snapshot_path() -> String {
    "stories.json".into()
}
fn default_state_db() -> String {
    ".storysync/state.db".into()
}

/// Which sink receives published snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Api,
    Git,
}

/// `[sink]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Selected sink; absent means nothing is configured.
    #[serde(default)]
    pub kind: Option<SinkKind>,

    #[serde(default)]
    pub api: Option<ApiSinkConfig>,

    #[serde(default)]
    pub git: Option<GitSinkConfig>,
}

/// `[sink.api]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSinkConfig {
    /// Base URL the `/check`, `/create`, `/add-unit` endpoints live under.
    pub base_url: String,

    /// Name of the env var holding the bearer token (never store the token itself).
    #[serde(default = "default_api_token_env")]
    pub token_env: String,
}

fn default_api_token_env() -> String {
    "STORYSYNC_API_TOKEN".into()
}

/// `[sink.git]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSinkConfig {
    /// Local working copy of the target repository.
    #[serde(default = "default_repo_dir")]
    pub repo_dir: String,

    /// Snapshot path inside the repository.
    #[serde(default = "default_snapshot_path")]
    pub file: String,

    /// Remote to push to.
    pub remote_url: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Name of the env var holding the push token.
    #[serde(default = "default_git_token_env")]
    pub token_env: String,

    #[serde(default = "default_author_name")]
    pub author_name: String,

    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_repo_dir() -> String {
    ".".into()
}
fn default_branch() -> String {
    "main".into()
}
fn default_git_token_env() -> String {
    "STORYSYNC_GIT_TOKEN".into()
}
fn default_author_name() -> String {
    "storysync-bot".into()
}
fn default_author_email() -> String {
    "storysync-bot@users.noreply.github.com".into()
}

// ---------------------------------------------------------------------------
// Runtime config (merged from config file + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime sync configuration, merged from the config file and CLI flags.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: Option<String>,
    pub listing_templates: Vec<String>,
    pub first_page: u32,
    pub max_listing_pages: u32,
    pub max_catalog_entries: Option<usize>,
    pub priority_entries: Vec<String>,
    pub workers: usize,
    pub entity_parallelism: usize,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max: Duration,
    pub rate_limit: Duration,
    pub probe_miss_limit: u32,
    pub user_agent: String,
    pub max_entities_per_run: Option<usize>,
    pub deadline: Option<Duration>,
    pub publish_every: Option<usize>,
    pub snapshot_path: PathBuf,
    pub state_db: PathBuf,
    pub profile: SourceProfile,
}

impl From<&AppConfig> for SyncConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            base_url: config.source.base_url.clone(),
            listing_templates: config.source.listing_templates.clone(),
            first_page: config.source.first_page,
            max_listing_pages: config.source.max_listing_pages,
            max_catalog_entries: config.source.max_catalog_entries,
            priority_entries: config.source.priority_entries.clone(),
            workers: config.fetch.workers,
            entity_parallelism: config.fetch.entity_parallelism,
            timeout: Duration::from_secs(config.fetch.timeout_secs),
            max_attempts: config.fetch.max_attempts,
            backoff_base: Duration::from_millis(config.fetch.backoff_base_ms),
            backoff_multiplier: config.fetch.backoff_multiplier,
            backoff_max: Duration::from_millis(config.fetch.backoff_max_ms),
            rate_limit: Duration::from_millis(config.fetch.rate_limit_ms),
            probe_miss_limit: config.fetch.probe_miss_limit,
            user_agent: config.fetch.user_agent.clone(),
            max_entities_per_run: config.run.max_entities_per_run,
            deadline: config.run.deadline_secs.map(Duration::from_secs),
            publish_every: config.run.publish_every,
            snapshot_path: PathBuf::from(&config.storage.snapshot_path),
            state_db: PathBuf::from(&config.storage.state_db),
            profile: config.profile.clone(),
        }
    }
}

impl SyncConfig {
    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        if self.listing_templates.is_empty() && self.priority_entries.is_empty() {
            return Err(StorySyncError::config(
                "no listing templates or priority entries configured ([source] listing_templates)",
            ));
        }
        if self.workers == 0 {
            return Err(StorySyncError::config("fetch.workers must be at least 1"));
        }
        if self.entity_parallelism == 0 {
            return Err(StorySyncError::config(
                "fetch.entity_parallelism must be at least 1",
            ));
        }
        if self.max_attempts == 0 || self.max_attempts > MAX_FETCH_ATTEMPTS {
            return Err(StorySyncError::config(format!(
                "fetch.max_attempts must be between 1 and {MAX_FETCH_ATTEMPTS}"
            )));
        }
        if self.probe_miss_limit == 0 {
            return Err(StorySyncError::config(
                "fetch.probe_miss_limit must be at least 1",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(StorySyncError::config(
                "fetch.backoff_multiplier must be a finite number >= 1.0",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sink resolution
// ---------------------------------------------------------------------------

/// A credential read from the environment. Never printed.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Sink settings with credentials resolved from the environment.
#[derive(Debug, Clone)]
pub enum ResolvedSink {
    Api {
        base_url: String,
        token: Secret,
    },
    Git {
        repo_dir: PathBuf,
        file: String,
        remote_url: String,
        branch: String,
        token: Secret,
        author_name: String,
        author_email: String,
    },
}

/// Resolve the configured sink and its credential.
///
/// A missing sink, missing sink table, or unset token variable is a
/// [`StorySyncError::Config`].
pub fn resolve_sink(config: &SinkConfig) -> Result<ResolvedSink> {
    match config.kind {
        None => Err(StorySyncError::config(
            "no sink configured: set [sink] kind = \"api\" or \"git\"",
        )),
        Some(SinkKind::Api) => {
            let api = config
                .api
                .as_ref()
                .ok_or_else(|| StorySyncError::config("sink kind is api but [sink.api] is missing"))?;
            if api.base_url.trim().is_empty() {
                return Err(StorySyncError::config("[sink.api] base_url is empty"));
            }
            Ok(ResolvedSink::Api {
                base_url: api.base_url.trim_end_matches('/').to_string(),
                token: read_token(&api.token_env)?,
            })
        }
        Some(SinkKind::Git) => {
            let git = config
                .git
                .as_ref()
                .ok_or_else(|| StorySyncError::config("sink kind is git but [sink.git] is missing"))?;
            if git.remote_url.trim().is_empty() {
                return Err(StorySyncError::config("[sink.git] remote_url is empty"));
            }
            Ok(ResolvedSink::Git {
                repo_dir: PathBuf::from(&git.repo_dir),
                file: git.file.clone(),
                remote_url: git.remote_url.clone(),
                branch: git.branch.clone(),
                token: read_token(&git.token_env)?,
                author_name: git.author_name.clone(),
                author_email: git.author_email.clone(),
            })
        }
    }
}

fn read_token(var_name: &str) -> Result<Secret> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(Secret::new(val)),
        _ => Err(StorySyncError::config(format!(
            "sink credential not found. Set the {var_name} environment variable."
        ))),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.storysync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| StorySyncError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.storysync/storysync.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| StorySyncError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        StorySyncError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| StorySyncError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| StorySyncError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| StorySyncError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
