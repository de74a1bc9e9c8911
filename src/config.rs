use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration (loaded from TOML)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SeamlessConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub buffer_remote: BufferRemoteConfig,

    #[serde(default)]
    pub fair: FairConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Local buffer and result cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory for persistent buffers and the local result store
    #[serde(default = "default_cache_dir")]
    pub dir: String,

    /// Keep transformation results in the local result store when no database is configured
    #[serde(default = "default_true")]
    pub persist_results: bool,

    /// How often unreferenced buffers are purged from memory
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval: String,

    /// How long an unreferenced buffer stays in memory
    #[serde(default = "default_lifetime_temp")]
    pub lifetime_temp: String,

    /// Same, for buffers smaller than `small_buffer_limit`
    #[serde(default = "default_lifetime_temp_small")]
    pub lifetime_temp_small: String,

    #[serde(default = "default_small_buffer_limit")]
    pub small_buffer_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            persist_results: true,
            eviction_interval: default_eviction_interval(),
            lifetime_temp: default_lifetime_temp(),
            lifetime_temp_small: default_lifetime_temp_small(),
            small_buffer_limit: default_small_buffer_limit(),
        }
    }
}

/// Checksum database service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// e.g. "http://localhost:5522"
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_http_timeout")]
    pub timeout: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: default_http_timeout(),
        }
    }
}

/// Remote buffer tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferRemoteConfig {
    #[serde(default)]
    pub read_servers: Vec<String>,

    #[serde(default)]
    pub read_folders: Vec<String>,

    #[serde(default)]
    pub write_server: Option<String>,

    #[serde(default = "default_http_timeout")]
    pub timeout: String,
}

impl Default for BufferRemoteConfig {
    fn default() -> Self {
        Self {
            read_servers: Vec::new(),
            read_folders: Vec::new(),
            write_server: None,
            timeout: default_http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FairConfig {
    #[serde(default)]
    pub servers: Vec<String>,
}

/// Where transformations run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Run in the calling process
    #[default]
    InProcess,
    /// Run in a worker that delegates nested work back through the lock protocol
    Local,
    /// Hand off to a remote compute service
    Remote,
}

impl std::str::FromStr for ExecutionStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_process" => Ok(Self::InProcess),
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => anyhow::bail!("execution.strategy must be one of: in_process, local, remote (got '{other}')"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub strategy: ExecutionStrategy,

    /// Compute service URL for the remote strategy
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Upper bound on a worker waiting for delegated work
    #[serde(default = "default_delegation_timeout")]
    pub delegation_timeout: String,

    /// Interval between polls of a pending remote job
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Grace period before an unreferenced transformation is destroyed
    #[serde(default = "default_keep_alive_min")]
    pub keep_alive_min: String,

    /// Grace period for transformations that ran longer than `alive_threshold`
    #[serde(default = "default_keep_alive_max")]
    pub keep_alive_max: String,

    #[serde(default = "default_alive_threshold")]
    pub alive_threshold: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategy::default(),
            remote_url: None,
            delegation_timeout: default_delegation_timeout(),
            poll_interval: default_poll_interval(),
            keep_alive_min: default_keep_alive_min(),
            keep_alive_max: default_keep_alive_max(),
            alive_threshold: default_alive_threshold(),
        }
    }
}

/// Default cache location, honoring XDG_CACHE_HOME
fn default_cache_dir() -> String {
    let dir = if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg_cache).join("seamless")
    } else if let Some(cache) = dirs::cache_dir() {
        cache.join("seamless")
    } else {
        PathBuf::from(".seamless-cache")
    };
    dir.to_string_lossy().into_owned()
}

fn default_true() -> bool {
    true
}

fn default_eviction_interval() -> String {
    "5s".to_string()
}

fn default_lifetime_temp() -> String {
    "20s".to_string()
}

fn default_lifetime_temp_small() -> String {
    "600s".to_string()
}

fn default_small_buffer_limit() -> usize {
    100_000
}

fn default_http_timeout() -> String {
    "10s".to_string()
}

fn default_delegation_timeout() -> String {
    "1h".to_string()
}

fn default_poll_interval() -> String {
    "2s".to_string()
}

fn default_keep_alive_min() -> String {
    "1s".to_string()
}

fn default_keep_alive_max() -> String {
    "20s".to_string()
}

fn default_alive_threshold() -> String {
    "20s".to_string()
}

/// Parse durations like "500ms", "20s", "10m", "1h", "1d"; a bare number means seconds
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim().to_lowercase();
    let number = |s: &str| -> Result<u64> {
        s.trim()
            .parse()
            .with_context(|| format!("Invalid duration '{text}'"))
    };

    if let Some(num) = text.strip_suffix("ms") {
        Ok(Duration::from_millis(number(num)?))
    } else if let Some(num) = text.strip_suffix('d') {
        Ok(Duration::from_secs(number(num)? * 24 * 60 * 60))
    } else if let Some(num) = text.strip_suffix('h') {
        Ok(Duration::from_secs(number(num)? * 60 * 60))
    } else if let Some(num) = text.strip_suffix('m') {
        Ok(Duration::from_secs(number(num)? * 60))
    } else if let Some(num) = text.strip_suffix('s') {
        Ok(Duration::from_secs(number(num)?))
    } else {
        Ok(Duration::from_secs(number(&text)?))
    }
}

impl SeamlessConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: SeamlessConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load an explicit config file, or discover one, or fall back to defaults
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        match discover_config(&cwd) {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache.dir.is_empty() {
            anyhow::bail!("cache.dir must be set");
        }

        for (name, value) in [
            ("cache.eviction_interval", &self.cache.eviction_interval),
            ("cache.lifetime_temp", &self.cache.lifetime_temp),
            ("cache.lifetime_temp_small", &self.cache.lifetime_temp_small),
            ("database.timeout", &self.database.timeout),
            ("buffer_remote.timeout", &self.buffer_remote.timeout),
            ("execution.delegation_timeout", &self.execution.delegation_timeout),
            ("execution.poll_interval", &self.execution.poll_interval),
            ("execution.keep_alive_min", &self.execution.keep_alive_min),
            ("execution.keep_alive_max", &self.execution.keep_alive_max),
            ("execution.alive_threshold", &self.execution.alive_threshold),
        ] {
            parse_duration(value).with_context(|| format!("{name} is not a valid duration"))?;
        }

        let urls = self
            .database
            .url
            .iter()
            .map(|u| ("database.url", u))
            .chain(self.buffer_remote.read_servers.iter().map(|u| ("buffer_remote.read_servers", u)))
            .chain(self.buffer_remote.write_server.iter().map(|u| ("buffer_remote.write_server", u)))
            .chain(self.fair.servers.iter().map(|u| ("fair.servers", u)))
            .chain(self.execution.remote_url.iter().map(|u| ("execution.remote_url", u)));
        for (name, url) in urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{name} must start with http:// or https://: {url}");
            }
        }

        if self.execution.strategy == ExecutionStrategy::Remote && self.execution.remote_url.is_none() {
            anyhow::bail!("execution.remote_url must be set when execution.strategy is remote");
        }

        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        PathBuf::from(&self.cache.dir)
    }

    /// Directory of persistent buffers
    pub fn buffer_dir(&self) -> PathBuf {
        self.cache_dir().join("buffers")
    }

    /// Directory of the local result store
    pub fn result_store_dir(&self) -> PathBuf {
        self.cache_dir().join("results")
    }

    /// Generate an example configuration as TOML
    pub fn example() -> String {
        let config = SeamlessConfig {
            database: DatabaseConfig {
                url: Some("http://localhost:5522".to_string()),
                ..Default::default()
            },
            buffer_remote: BufferRemoteConfig {
                read_servers: vec!["http://localhost:5577".to_string()],
                write_server: Some("http://localhost:5577".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Find `seamless.toml` by walking up from `start_dir`, then the user config
pub fn discover_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();
    loop {
        let candidate = current.join("seamless.toml");
        if candidate.exists() {
            return Some(candidate);
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    let global = dirs::config_dir()?.join("seamless").join("config.toml");
    global.exists().then_some(global)
}
