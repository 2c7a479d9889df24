//! Configuration for errloop.
//!
//! Loaded from `config.toml` in the errloop home. Every field has a default,
//! so a missing file or a partial file is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::ConfigError;
use crate::event::DEFAULT_MAX_ERROR_CHARS;
use crate::lock;
use crate::synth::DEFAULT_PROMOTION_THRESHOLD;

/// Config file name inside the errloop home.
pub const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Packs merged into the active ruleset. `learned` and `custom` always
    /// merge last regardless of their position here.
    pub enabled_packs: Vec<String>,
    /// Run a curation pass when a session ends
    pub auto_curate: bool,
    /// Failures a signature needs before automatic promotion
    pub promotion_threshold: u64,
    /// Append the rule confidence to block messages
    pub show_confidence: bool,
    /// Record successful commands as fixes
    pub track_fixes: bool,
    /// Cap on stored error text, in characters
    pub max_error_chars: usize,
    /// Tools whose commands are captured and checked
    pub guarded_tools: Vec<String>,
    /// How long writers wait for a contended store lock
    pub lock_timeout_ms: u64,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled_packs: vec!["common".into(), "learned".into(), "custom".into()],
            auto_curate: true,
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
            show_confidence: false,
            track_fixes: true,
            max_error_chars: DEFAULT_MAX_ERROR_CHARS,
            guarded_tools: vec!["Bash".into()],
            lock_timeout_ms: u64::try_from(lock::DEFAULT_LOCK_TIMEOUT.as_millis())
                .unwrap_or(2_000),
            logging: LoggingConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `ERRLOOP_LOG` is unset (e.g. "warn",
    /// "errloop_core=debug")
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// `[paths]` section. Relative paths resolve against the errloop home.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub ledger: PathBuf,
    pub packs_dir: PathBuf,
    pub active: PathBuf,
    pub allowlist: PathBuf,
    pub curated_log: PathBuf,
    pub log_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ledger: PathBuf::from("data/errors.jsonl"),
            packs_dir: PathBuf::from("patterns/packs"),
            active: PathBuf::from("patterns/active.json"),
            allowlist: PathBuf::from("patterns/allowlist.json"),
            curated_log: PathBuf::from("data/curated.log"),
            log_file: PathBuf::from("data/errloop.log"),
        }
    }
}

impl Config {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(
                    ConfigError::ReadFailed(path.display().to_string(), e.to_string()).into(),
                );
            }
        };
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.promotion_threshold < 1 {
            return Err(ConfigError::ValidationError(
                "promotion_threshold must be at least 1".to_string(),
            ));
        }
        if let Some(bad) = self
            .enabled_packs
            .iter()
            .find(|name| name.trim().is_empty() || name.contains(['/', '\\']))
        {
            return Err(ConfigError::ValidationError(format!(
                "invalid pack name '{bad}' in enabled_packs"
            )));
        }
        if self.guarded_tools.iter().any(|tool| tool.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "guarded_tools entries cannot be empty".to_string(),
            ));
        }
        if self.max_error_chars == 0 {
            return Err(ConfigError::ValidationError(
                "max_error_chars must be positive".to_string(),
            ));
        }
        tracing_subscriber::EnvFilter::try_new(&self.logging.level).map_err(|e| {
            ConfigError::ValidationError(format!(
                "invalid logging.level '{}': {e}",
                self.logging.level
            ))
        })?;
        Ok(())
    }

    /// Whether commands from `tool` are captured and checked.
    #[must_use]
    pub fn guards(&self, tool: &str) -> bool {
        self.guarded_tools
            .iter()
            .any(|guarded| guarded.eq_ignore_ascii_case(tool))
    }

    #[must_use]
    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Add or remove `name` from `enabled_packs` in the config file at `path`,
/// preserving comments and layout. Creates the file if missing.
///
/// Returns `false` when the pack was already in the requested state.
pub fn set_pack_enabled(path: &Path, name: &str, enabled: bool) -> Result<bool> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(ConfigError::ReadFailed(path.display().to_string(), e.to_string()).into());
        }
    };
    let mut doc = content
        .parse::<toml_edit::DocumentMut>()
        .map_err(|e| ConfigError::ParseFailed(e.to_string()))?;

    if doc.get("enabled_packs").is_none() {
        let mut defaults = toml_edit::Array::new();
        for pack in Config::default().enabled_packs {
            defaults.push(pack);
        }
        doc["enabled_packs"] = toml_edit::value(defaults);
    }
    let packs = doc["enabled_packs"].as_array_mut().ok_or_else(|| {
        ConfigError::ValidationError("enabled_packs must be an array".to_string())
    })?;

    let present = packs.iter().any(|v| v.as_str() == Some(name));
    let changed = match (enabled, present) {
        (true, false) => {
            packs.push(name);
            true
        }
        (false, true) => {
            packs.retain(|v| v.as_str() != Some(name));
            true
        }
        _ => false,
    };

    if changed {
        let updated = doc.to_string();
        // Reject edits that would leave an unloadable config behind.
        Config::from_toml_str(&updated)?;
        lock::rewrite_atomic(
            path,
            updated.as_bytes(),
            "config-edit",
            lock::DEFAULT_LOCK_TIMEOUT,
        )?;
        tracing::info!(pack = name, enabled, "Updated enabled packs");
    }
    Ok(changed)
}

/// Commented starter config written by `errloop init`.
pub const DEFAULT_CONFIG_TOML: &str = r#"# errloop configuration

# Packs merged into the active ruleset, in order. "learned" and "custom"
# always merge last so learned rules and your own overrides win.
enabled_packs = ["common", "learned", "custom"]

# Promote repeated failures automatically when a session ends.
auto_curate = true

# Failures of one signature needed before automatic promotion.
promotion_threshold = 2

# Append "Confidence: N%" to block messages.
show_confidence = false

# Record successful commands as fixes for earlier failures.
track_fixes = true

max_error_chars = 2000
guarded_tools = ["Bash"]

[logging]
# Overridden by the ERRLOOP_LOG environment variable.
level = "warn"
format = "pretty"
"#;
