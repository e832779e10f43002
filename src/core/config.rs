//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, UgkError};

/// Full gatekeeper configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub prompt: PromptConfig,
    pub classifier: ClassifierConfig,
    pub enforcement: EnforcementConfig,
    pub paths: PathsConfig,
}

/// Admission engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay before an incomplete attach event is re-checked.
    pub debounce_ms: u64,
    /// Remembered human allows per vendor before the vendor is auto-allowed.
    pub auto_allow_threshold: u64,
    /// Worker threads running the decision pipeline and enforcement.
    pub workers: usize,
    /// Capacity of the hotplug event channel.
    pub event_channel_capacity: usize,
}

/// How the human is asked when history and classifier are inconclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// Ask on the controlling terminal.
    Tty,
    /// Run an external helper program (e.g. a desktop dialog).
    Command,
    /// Never ask; every prompt fails closed.
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    pub mode: PromptMode,
    /// argv of the helper program for `mode = "command"`.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    pub enabled: bool,
    pub model_file: PathBuf,
    /// Optional hex SHA-256 the model artifact must match before it is used.
    pub model_sha256: Option<String>,
}

/// OS enforcement targets and behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnforcementConfig {
    pub media_root: PathBuf,
    /// User whose media directory receives mounts. Falls back to `$SUDO_USER`,
    /// then the effective user.
    pub mount_user: Option<String>,
    pub automount_rules_file: PathBuf,
    pub block_rules_file: PathBuf,
    pub dedupe_block_rules: bool,
    pub use_sudo: bool,
    pub manage_automount: bool,
    /// sysfs mount point used for block-device resolution.
    pub sysfs_root: PathBuf,
    /// Directory holding block device nodes.
    pub dev_root: PathBuf,
}

/// Filesystem paths used by ugk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub decision_log: PathBuf,
    pub vendor_counts: PathBuf,
    pub sqlite_db: PathBuf,
    pub jsonl_log: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_000,
            auto_allow_threshold: 5,
            workers: 2,
            event_channel_capacity: 256,
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            mode: PromptMode::Tty,
            command: Vec::new(),
            timeout_secs: 60,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_file: data_dir().join("model.json"),
            model_sha256: None,
        }
    }
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("/media"),
            mount_user: None,
            automount_rules_file: PathBuf::from(
                "/etc/udev/rules.d/99-disable-usb-automount.rules",
            ),
            block_rules_file: PathBuf::from("/etc/udev/rules.d/99-usb-blacklist.rules"),
            dedupe_block_rules: true,
            use_sudo: !running_as_root(),
            manage_automount: true,
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let cfg = home_dir().join(".config").join("ugk").join("config.toml");
        let data = data_dir();
        Self {
            config_file: cfg,
            decision_log: data.join("decisions.json"),
            vendor_counts: data.join("vendor_allow_counts.json"),
            sqlite_db: data.join("activity.sqlite3"),
            jsonl_log: data.join("activity.jsonl"),
        }
    }
}

fn home_dir() -> PathBuf {
    env::var_os("HOME").map_or_else(
        || {
            eprintln!("[UGK-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
            PathBuf::from("/tmp")
        },
        PathBuf::from,
    )
}

fn data_dir() -> PathBuf {
    home_dir().join(".local").join("share").join("ugk")
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| UgkError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(UgkError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // engine
        if let Some(raw) = lookup("UGK_ENGINE_DEBOUNCE_MS") {
            self.engine.debounce_ms = parse_env("UGK_ENGINE_DEBOUNCE_MS", &raw)?;
        }
        if let Some(raw) = lookup("UGK_ENGINE_AUTO_ALLOW_THRESHOLD") {
            self.engine.auto_allow_threshold = parse_env("UGK_ENGINE_AUTO_ALLOW_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("UGK_ENGINE_WORKERS") {
            self.engine.workers = parse_env("UGK_ENGINE_WORKERS", &raw)?;
        }

        // prompt
        if let Some(raw) = lookup("UGK_PROMPT_MODE") {
            self.prompt.mode = match raw.trim() {
                "tty" => PromptMode::Tty,
                "command" => PromptMode::Command,
                "deny" => PromptMode::Deny,
                other => {
                    return Err(UgkError::ConfigParse {
                        context: "env",
                        details: format!("UGK_PROMPT_MODE={other:?}: expected tty|command|deny"),
                    });
                }
            };
        }
        if let Some(raw) = lookup("UGK_PROMPT_TIMEOUT_SECS") {
            self.prompt.timeout_secs = parse_env("UGK_PROMPT_TIMEOUT_SECS", &raw)?;
        }

        // classifier
        if let Some(raw) = lookup("UGK_CLASSIFIER_ENABLED") {
            self.classifier.enabled = parse_env("UGK_CLASSIFIER_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("UGK_CLASSIFIER_MODEL_FILE") {
            self.classifier.model_file = PathBuf::from(raw);
        }

        // enforcement
        if let Some(raw) = lookup("UGK_ENFORCEMENT_MEDIA_ROOT") {
            self.enforcement.media_root = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("UGK_ENFORCEMENT_MOUNT_USER") {
            self.enforcement.mount_user = Some(raw);
        }
        if let Some(raw) = lookup("UGK_ENFORCEMENT_DEDUPE_BLOCK_RULES") {
            self.enforcement.dedupe_block_rules =
                parse_env("UGK_ENFORCEMENT_DEDUPE_BLOCK_RULES", &raw)?;
        }
        if let Some(raw) = lookup("UGK_ENFORCEMENT_USE_SUDO") {
            self.enforcement.use_sudo = parse_env("UGK_ENFORCEMENT_USE_SUDO", &raw)?;
        }
        if let Some(raw) = lookup("UGK_ENFORCEMENT_MANAGE_AUTOMOUNT") {
            self.enforcement.manage_automount =
                parse_env("UGK_ENFORCEMENT_MANAGE_AUTOMOUNT", &raw)?;
        }

        // paths
        if let Some(raw) = lookup("UGK_PATHS_DECISION_LOG") {
            self.paths.decision_log = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("UGK_PATHS_VENDOR_COUNTS") {
            self.paths.vendor_counts = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("UGK_PATHS_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("UGK_PATHS_SQLITE_DB") {
            self.paths.sqlite_db = PathBuf::from(raw);
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.engine.auto_allow_threshold == 0 {
            return Err(UgkError::InvalidConfig {
                details: "engine.auto_allow_threshold must be >= 1".to_string(),
            });
        }
        if self.engine.workers == 0 {
            return Err(UgkError::InvalidConfig {
                details: "engine.workers must be >= 1".to_string(),
            });
        }
        if self.engine.event_channel_capacity == 0 {
            return Err(UgkError::InvalidConfig {
                details: "engine.event_channel_capacity must be >= 1".to_string(),
            });
        }

        if self.prompt.mode == PromptMode::Command && self.prompt.command.is_empty() {
            return Err(UgkError::InvalidConfig {
                details: "prompt.command must name a program when prompt.mode = \"command\""
                    .to_string(),
            });
        }
        if self.prompt.timeout_secs == 0 {
            return Err(UgkError::InvalidConfig {
                details: "prompt.timeout_secs must be > 0".to_string(),
            });
        }

        if let Some(digest) = &self.classifier.model_sha256
            && (digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(UgkError::InvalidConfig {
                details: format!("classifier.model_sha256 must be 64 hex chars, got {digest:?}"),
            });
        }

        for (name, path) in [
            ("enforcement.media_root", &self.enforcement.media_root),
            (
                "enforcement.automount_rules_file",
                &self.enforcement.automount_rules_file,
            ),
            (
                "enforcement.block_rules_file",
                &self.enforcement.block_rules_file,
            ),
        ] {
            if !path.is_absolute() {
                return Err(UgkError::InvalidConfig {
                    details: format!("{name} must be an absolute path, got {}", path.display()),
                });
            }
        }

        if self.enforcement.automount_rules_file == self.enforcement.block_rules_file {
            return Err(UgkError::InvalidConfig {
                details: "automount and block rule files must differ".to_string(),
            });
        }

        if let Some(user) = &self.enforcement.mount_user
            && (user.is_empty() || user.contains('/') || user == "." || user == "..")
        {
            return Err(UgkError::InvalidConfig {
                details: format!("enforcement.mount_user is not a valid user name: {user:?}"),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| UgkError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
