use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CairnConfig {
    pub server: ServerConfig,
    pub workspace: WorkspaceConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub index: IndexConfig,
    pub heartbeat: HeartbeatConfig,
    pub session: SessionConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root: String,
    /// How long an interactive writer waits for the workspace lock.
    pub lock_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub lexical_weight: f64,
    pub semantic_weight: f64,
    /// Semantic candidates below this cosine similarity are discarded.
    pub min_similarity: f64,
    /// Report hash-mismatched candidates in the "use with caution" side-channel.
    pub report_unverified: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    pub max_chunk_tokens: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    /// Local wall-clock window, `HH:MM`. A window whose start is after its end wraps midnight.
    pub active_start: String,
    pub active_end: String,
    pub task_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub token_budget: usize,
    pub keep_recent: usize,
    pub recent_daily_logs: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tool_rounds: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            log_level: "info".into(),
            host: "127.0.0.1".into(),
            port: 31327,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        let root = default_cairn_dir()
            .join("workspace")
            .to_string_lossy()
            .into_owned();
        Self {
            root,
            lock_timeout_secs: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_cairn_dir()
            .join("index.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_cairn_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            timeout_ms: 5000,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            lexical_weight: 0.4,
            semantic_weight: 0.6,
            min_similarity: 0.25,
            report_unverified: true,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_chunk_tokens: 256,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 15,
            active_start: "07:00".into(),
            active_end: "22:00".into(),
            task_timeout_secs: 120,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_budget: 8000,
            keep_recent: 6,
            recent_daily_logs: 3,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".into(),
            api_key: String::new(),
            model: "llama3.1".into(),
            timeout_secs: 120,
            max_tool_rounds: 2,
        }
    }
}

impl WorkspaceConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.max(1) * 60)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Parse the active window. Unparseable bounds fall back to "always active".
    pub fn active_window(&self) -> Option<(NaiveTime, NaiveTime)> {
        let start = NaiveTime::parse_from_str(&self.active_start, "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(&self.active_end, "%H:%M").ok()?;
        Some((start, end))
    }

    /// Whether `time` falls inside the active window.
    pub fn is_active_at(&self, time: NaiveTime) -> bool {
        match self.active_window() {
            None => true,
            Some((start, end)) if start == end => true,
            Some((start, end)) if start < end => time >= start && time < end,
            Some((start, end)) => time >= start || time < end,
        }
    }
}

/// Returns `~/.cairn/`
pub fn default_cairn_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cairn")
}

/// Returns the default config file path: `~/.cairn/config.toml`
pub fn default_config_path() -> PathBuf {
    default_cairn_dir().join("config.toml")
}

impl CairnConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            CairnConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (CAIRN_WORKSPACE, CAIRN_DB, CAIRN_LOG_LEVEL, CAIRN_API_KEY).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CAIRN_WORKSPACE") {
            self.workspace.root = val;
        }
        if let Ok(val) = std::env::var("CAIRN_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("CAIRN_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("CAIRN_API_KEY") {
            self.generation.api_key = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// Resolve the workspace root, expanding `~` if needed.
    pub fn resolved_workspace_root(&self) -> PathBuf {
        expand_tilde(&self.workspace.root)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
