//! Plugin configuration.
//!
//! Values resolve in three layers: built-in defaults, an optional TOML file,
//! then `NPU_*` environment overrides. Every section carries serde defaults so
//! an empty file is a valid configuration.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, ConfigValueSource, Sourced};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;
use crate::policy::DEFAULT_FAULT_CODE_FILE;
use crate::types::ChipKind;

/// Default polling period of the list-and-watch loop.
pub const DEFAULT_LIST_AND_WATCH_PERIOD_SECS: u64 = 5;
/// Default interval between device-info write attempts.
pub const DEFAULT_WRITE_INTERVAL_MS: u64 = 1000;
/// Default bound on one device-info write, retries included.
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
/// Unchanged device-info records are rewritten after this long.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 3600;
/// Default directory for the file-backed record store.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/npud";

// ── Sections ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    /// Name of the node this plugin runs on; used in log fields and record keys.
    pub node_name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            node_name: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub list_and_watch_period_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            list_and_watch_period_secs: DEFAULT_LIST_AND_WATCH_PERIOD_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultPolicyConfig {
    pub fault_code_file: PathBuf,
}

impl Default for FaultPolicyConfig {
    fn default() -> Self {
        Self {
            fault_code_file: PathBuf::from(DEFAULT_FAULT_CODE_FILE),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// When set, the raw current-cycle sets are published with no staging.
    pub auto_stowing_devs: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_stowing_devs: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub write_interval_ms: u64,
    pub write_timeout_secs: u64,
    pub flush_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            write_interval_ms: DEFAULT_WRITE_INTERVAL_MS,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
        }
    }
}

impl StoreConfig {
    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Workload mode hot reset is enabled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotResetMode {
    #[default]
    Off,
    Infer,
    Train,
}

impl HotResetMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(HotResetMode::Off),
            "infer" => Some(HotResetMode::Infer),
            "train" => Some(HotResetMode::Train),
            _ => None,
        }
    }
}

impl fmt::Display for HotResetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HotResetMode::Off => write!(f, "off"),
            HotResetMode::Infer => write!(f, "infer"),
            HotResetMode::Train => write!(f, "train"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotResetConfig {
    pub mode: HotResetMode,
    pub chip: ChipKind,
    /// Command run per device; `{logic_id}` is replaced by the logical id.
    pub reset_command: Vec<String>,
    pub max_attempts: u32,
    pub retry_wait_secs: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for HotResetConfig {
    fn default() -> Self {
        Self {
            mode: HotResetMode::Off,
            chip: ChipKind::Ascend910,
            reset_command: ["npu-smi", "set", "-t", "reset", "-i", "{logic_id}", "-c", "0"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_attempts: 3,
            retry_wait_secs: 5,
            attempt_timeout_secs: 120,
        }
    }
}

// ── Plugin configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub fault_policy: FaultPolicyConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub hot_reset: HotResetConfig,
}

impl PluginConfig {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Toml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load from `path` (or defaults when `None`), apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<(Self, Vec<ConfigValueSource>), ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&content, path)?
            }
            None => Self::default(),
        };
        let overrides = config.apply_env_overrides()?;
        config.validate()?;
        Ok((config, overrides))
    }

    /// Apply `NPU_*` overrides on top of the current values.
    ///
    /// Returns the keys that were overridden. All invalid variables are
    /// reported together.
    pub fn apply_env_overrides(&mut self) -> Result<Vec<ConfigValueSource>, ConfigError> {
        let mut parser = EnvParser::new();
        let mut applied = Vec::new();

        let log_level = parser.get_log_level("LOG_LEVEL", &self.general.log_level);
        let node_name = parser.get_string("NODE_NAME", &self.general.node_name);
        let period = parser.get_duration(
            "LIST_WATCH_PERIOD",
            Duration::from_secs(self.polling.list_and_watch_period_secs),
        );
        let auto_stowing = parser.get_bool("AUTO_STOWING", self.recovery.auto_stowing_devs);
        let fault_file = parser.get_path(
            "FAULT_CODE_FILE",
            &self.fault_policy.fault_code_file.to_string_lossy(),
        );
        let data_dir = parser.get_path("DATA_DIR", &self.store.data_dir.to_string_lossy());
        let store_timeout =
            parser.get_u64_range("STORE_TIMEOUT_SECS", self.store.write_timeout_secs, 1, 600);
        let mode = parser.get_choice(
            "HOT_RESET",
            &self.hot_reset.mode.to_string(),
            &["off", "infer", "train"],
        );

        if parser.has_errors() {
            return Err(ConfigError::Environment(parser.take_errors()));
        }

        let mut record = |key: &str, sourced_env: Option<String>| {
            applied.push(ConfigValueSource {
                key: key.to_string(),
                source: ConfigSource::Environment,
                env_var: sourced_env,
            });
        };

        if log_level.is_env() {
            record("general.log_level", log_level.env_var.clone());
            self.general.log_level = log_level.value;
        }
        if node_name.is_env() {
            record("general.node_name", node_name.env_var.clone());
            self.general.node_name = node_name.value;
        }
        if period.is_env() {
            record("polling.list_and_watch_period_secs", period.env_var.clone());
            self.polling.list_and_watch_period_secs = period.value.as_secs().max(1);
        }
        if auto_stowing.is_env() {
            record("recovery.auto_stowing_devs", auto_stowing.env_var.clone());
            self.recovery.auto_stowing_devs = auto_stowing.value;
        }
        if fault_file.is_env() {
            record("fault_policy.fault_code_file", fault_file.env_var.clone());
            self.fault_policy.fault_code_file = fault_file.value;
        }
        if data_dir.is_env() {
            record("store.data_dir", data_dir.env_var.clone());
            self.store.data_dir = data_dir.value;
        }
        if store_timeout.is_env() {
            record("store.write_timeout_secs", store_timeout.env_var.clone());
            self.store.write_timeout_secs = store_timeout.value;
        }
        if mode.is_env() {
            record("hot_reset.mode", mode.env_var.clone());
            self.hot_reset.mode = HotResetMode::parse(&mode.value).unwrap_or_default();
        }

        Ok(applied)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.list_and_watch_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "polling.list_and_watch_period_secs must be at least 1".to_string(),
            ));
        }
        if self.general.node_name.trim().is_empty() {
            return Err(ConfigError::Invalid("general.node_name must not be empty".to_string()));
        }
        if self.store.write_interval_ms == 0 {
            return Err(ConfigError::Invalid("store.write_interval_ms must be at least 1".to_string()));
        }
        if self.store.write_timeout() < self.store.write_interval() {
            return Err(ConfigError::Invalid(
                "store.write_timeout_secs must not be shorter than store.write_interval_ms".to_string(),
            ));
        }
        if self.hot_reset.mode == HotResetMode::Infer && self.hot_reset.chip == ChipKind::Ascend910 {
            return Err(ConfigError::Invalid(
                "hot_reset.mode = \"infer\" is only supported on Ascend910B".to_string(),
            ));
        }
        if self.hot_reset.mode != HotResetMode::Off {
            if self.hot_reset.reset_command.is_empty() {
                return Err(ConfigError::Invalid("hot_reset.reset_command must not be empty".to_string()));
            }
            if self.hot_reset.max_attempts == 0 {
                return Err(ConfigError::Invalid("hot_reset.max_attempts must be at least 1".to_string()));
            }
        }
        Ok(())
    }

    pub fn list_and_watch_period(&self) -> Duration {
        Duration::from_secs(self.polling.list_and_watch_period_secs)
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = PluginConfig::from_toml_str("", Path::new("npud.toml")).unwrap();
        assert_eq!(config.polling.list_and_watch_period_secs, 5);
        assert!(config.recovery.auto_stowing_devs);
        assert_eq!(config.fault_policy.fault_code_file, PathBuf::from("/usr/local/faultCode.json"));
        assert_eq!(config.store.write_interval(), Duration::from_secs(1));
        assert_eq!(config.store.write_timeout(), Duration::from_secs(10));
        assert_eq!(config.store.flush_interval(), Duration::from_secs(3600));
        assert_eq!(config.hot_reset.mode, HotResetMode::Off);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let toml = r#"
            [recovery]
            auto_stowing_devs = false

            [hot_reset]
            mode = "train"
            chip = "Ascend910B"
        "#;
        let config = PluginConfig::from_toml_str(toml, Path::new("npud.toml")).unwrap();
        assert!(!config.recovery.auto_stowing_devs);
        assert_eq!(config.hot_reset.mode, HotResetMode::Train);
        assert_eq!(config.hot_reset.chip, ChipKind::Ascend910B);
        assert_eq!(config.hot_reset.max_attempts, 3);
        assert_eq!(config.polling.list_and_watch_period_secs, 5);
    }

    #[test]
    fn test_malformed_toml_reports_path() {
        let err = PluginConfig::from_toml_str("[polling\n", Path::new("/etc/npud.toml")).unwrap_err();
        assert!(err.to_string().contains("/etc/npud.toml"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PluginConfig::default();
        config.polling.list_and_watch_period_secs = 0;
        assert!(config.validate().is_err());

        let mut config = PluginConfig::default();
        config.store.write_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = PluginConfig::default();
        config.hot_reset.mode = HotResetMode::Infer;
        assert!(config.validate().is_err());
        config.hot_reset.chip = ChipKind::Ascend910B;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_are_applied_and_reported() {
        let _guard = env_test_lock();
        let vars = ["NPU_AUTO_STOWING", "NPU_LIST_WATCH_PERIOD", "NPU_HOT_RESET"];
        for var in vars {
            // SAFETY: Tests are serialized via env_test_lock
            unsafe { std::env::remove_var(var) };
        }

        // SAFETY: Tests are serialized via env_test_lock
        unsafe {
            std::env::set_var("NPU_AUTO_STOWING", "false");
            std::env::set_var("NPU_LIST_WATCH_PERIOD", "10s");
        }
        let mut config = PluginConfig::default();
        let applied = config.apply_env_overrides().unwrap();
        assert!(!config.recovery.auto_stowing_devs);
        assert_eq!(config.polling.list_and_watch_period_secs, 10);
        assert_eq!(applied.len(), 2);
        assert!(applied.iter().all(|a| a.source == ConfigSource::Environment));

        // SAFETY: Tests are serialized via env_test_lock
        unsafe { std::env::set_var("NPU_HOT_RESET", "sometimes") };
        let mut config = PluginConfig::default();
        let err = config.apply_env_overrides().unwrap_err();
        assert!(matches!(err, ConfigError::Environment(ref errors) if errors.len() == 1));

        for var in vars {
            // SAFETY: Tests are serialized via env_test_lock
            unsafe { std::env::remove_var(var) };
        }
    }
}
