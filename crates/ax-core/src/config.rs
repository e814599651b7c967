use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level settings loaded from a single JSON file.
///
/// Every field is `#[serde(default)]` so missing keys fall back to the
/// compiled defaults and unknown keys are ignored. There is no hot reload;
/// the daemon reads settings once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub intervention: InterventionConfig,
    #[serde(default)]
    pub verbose: VerboseConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
            intervention: InterventionConfig::default(),
            verbose: VerboseConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Settings::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize to pretty JSON and write to `path`, creating parent
    /// directories as needed.
    pub fn save_to(&self, path: impl Into<PathBuf>) -> Result<(), ConfigError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let text =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(&path, text).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// Default settings location: `$HOME/.axiom/settings.json`.
    pub fn default_path() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".axiom")
            .join("settings.json")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Path to the agent binary. `CLAUDE_CODE_PATH` overrides at spawn time.
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,
    #[serde(default = "default_pty_cols")]
    pub pty_cols: u16,
    #[serde(default = "default_pty_rows")]
    pub pty_rows: u16,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            agent_binary: default_agent_binary(),
            startup_timeout_secs: default_startup_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            heartbeat_secs: default_heartbeat(),
            task_timeout_secs: default_task_timeout(),
            max_parallel: default_max_parallel(),
            max_retries: default_max_retries(),
            output_cap_bytes: default_output_cap(),
            pty_cols: default_pty_cols(),
            pty_rows: default_pty_rows(),
        }
    }
}

fn default_agent_binary() -> String {
    "claude".into()
}
fn default_startup_timeout() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    30
}
fn default_heartbeat() -> u64 {
    10
}
fn default_task_timeout() -> u64 {
    600
}
fn default_max_parallel() -> usize {
    10
}
fn default_max_retries() -> u32 {
    2
}
fn default_output_cap() -> usize {
    64 * 1024
}
fn default_pty_cols() -> u16 {
    80
}
fn default_pty_rows() -> u16 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Fallback level when `LOG_LEVEL`/`RUST_LOG` are unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for the append-only JSONL event logs.
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_dir() -> String {
    ".axiom/logs".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-(task, action) cooldown to prevent flapping.
    #[serde(default = "default_action_cooldown")]
    pub action_cooldown_ms: u64,
    /// Window for claim verification after a file-creation claim.
    #[serde(default = "default_verify_window")]
    pub verify_window_secs: u64,
    /// Silence before the endless-planning rule may fire.
    #[serde(default = "default_planning_grace")]
    pub planning_grace_secs: u64,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            action_cooldown_ms: default_action_cooldown(),
            verify_window_secs: default_verify_window(),
            planning_grace_secs: default_planning_grace(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_action_cooldown() -> u64 {
    5_000
}
fn default_verify_window() -> u64 {
    10
}
fn default_planning_grace() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerboseConfig {
    /// Run `spawn` requests in background mode by default.
    #[serde(default)]
    pub background_default: bool,
    /// Echo every stream chunk to the console log at DEBUG.
    #[serde(default)]
    pub echo_stream: bool,
}

impl Default for VerboseConfig {
    fn default() -> Self {
        Self {
            background_default: false,
            echo_stream: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
