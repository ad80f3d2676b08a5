//! TOML-based configuration for a BT-Chat node.
//!
//! Reads `AppConfig` from the platform-appropriate config file:
//! - Windows:  `%APPDATA%\BtChat\config.toml`
//! - Linux:    `~/.config/btchat/config.toml`
//! - macOS:    `~/Library/Application Support/BtChat/config.toml`
//!
//! ```toml
//! [node]
//! name = "btchat"
//! log_level = "info"
//!
//! [radio]
//! listen_address = "127.0.0.1:30500"
//! service_uuid = "4be62338-e699-462a-9862-246f6ea434d3"
//! accept_mode = "single"
//!
//! [[paired]]
//! address = "127.0.0.1:30501"
//! name = "peer"
//! ```
//!
//! Fields annotated with `#[serde(default = "...")]` fall back to the
//! built-in value when absent, so a first run without a file and an older
//! file missing newer keys both work.

use std::path::{Path, PathBuf};

use btchat_core::{Device, ServiceId, MAX_FRAME_LEN};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::network::connection_manager::{AcceptMode, ManagerConfig};
use crate::infrastructure::radio::StaticCapabilities;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but is unusable.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level node configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    /// Devices bonded with this node.
    #[serde(default)]
    pub paired: Vec<Device>,
    /// Devices reported by a scan.
    #[serde(default)]
    pub nearby: Vec<Device>,
}

/// Identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Name shown to the peer as the sender of local messages.
    #[serde(default = "default_name")]
    pub name: String,
    /// `tracing` level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Radio and session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RadioConfig {
    /// `false` makes the radio unavailable at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Loopback address this node listens on when acting as server.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Service identifier; must match the peer exactly.
    #[serde(default)]
    pub service_uuid: ServiceId,
    /// Whether a server accepts one peer or keeps accepting after each session.
    #[serde(default)]
    pub accept_mode: AcceptMode,
    /// Bytes requested per stream read; one read is one frame.  At least
    /// `MAX_FRAME_LEN` so a maximal frame fits in a single read.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Granted "scan" capability.
    #[serde(default = "default_true")]
    pub can_scan: bool,
    /// Granted "connect" capability.
    #[serde(default = "default_true")]
    pub can_connect: bool,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "btchat".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_listen_address() -> String {
    "127.0.0.1:30500".to_string()
}
fn default_read_buffer_size() -> usize {
    MAX_FRAME_LEN
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            listen_address: default_listen_address(),
            service_uuid: ServiceId::DEFAULT,
            accept_mode: AcceptMode::default(),
            read_buffer_size: default_read_buffer_size(),
            can_scan: default_true(),
            can_connect: default_true(),
        }
    }
}

impl AppConfig {
    /// Checks values that deserialize fine but cannot be used.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.contains(btchat_core::SEPARATOR) {
            return Err(ConfigError::Invalid(format!(
                "node.name {:?} must not contain '#'",
                self.node.name
            )));
        }
        if self.radio.read_buffer_size < MAX_FRAME_LEN {
            return Err(ConfigError::Invalid(format!(
                "radio.read_buffer_size {} is below the maximum frame length {MAX_FRAME_LEN}",
                self.radio.read_buffer_size
            )));
        }
        Ok(())
    }

    /// Session engine settings derived from the `[radio]` section.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            service_id: self.radio.service_uuid,
            accept_mode: self.radio.accept_mode,
            read_buffer_size: self.radio.read_buffer_size,
            ..ManagerConfig::default()
        }
    }

    pub fn capabilities(&self) -> StaticCapabilities {
        StaticCapabilities {
            scan: self.radio.can_scan,
            connect: self.radio.can_connect,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads and validates `AppConfig` from `path`, or from the platform default
/// location when `path` is `None`.  A missing file yields the defaults.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] for malformed TOML, and [`ConfigError::Invalid`]
/// for unusable values.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };

    let cfg = match std::fs::read_to_string(&path) {
        Ok(content) => toml::from_str::<AppConfig>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => return Err(ConfigError::Io { path, source: e }),
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("BtChat"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("btchat"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("BtChat")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_app_config_default_values() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.node.name, "btchat");
        assert_eq!(cfg.radio.service_uuid, ServiceId::DEFAULT);
        assert_eq!(cfg.radio.accept_mode, AcceptMode::Single);
        assert_eq!(cfg.radio.read_buffer_size, 1024);
        assert!(cfg.paired.is_empty());
    }

    #[test]
    fn test_deserialize_empty_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_deserialize_full_toml() {
        // Arrange
        let toml_str = r#"
[node]
name = "alice"

[radio]
listen_address = "127.0.0.1:40000"
service_uuid = "00001101-0000-1000-8000-00805f9b34fb"
accept_mode = "repeat"
can_scan = false

[[paired]]
address = "127.0.0.1:40001"
name = "bob"

[[nearby]]
address = "127.0.0.1:40002"
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize");

        // Assert
        assert_eq!(cfg.node.name, "alice");
        assert_eq!(cfg.node.log_level, "info");
        assert_eq!(cfg.radio.accept_mode, AcceptMode::Repeat);
        assert_eq!(
            cfg.radio.service_uuid.to_string(),
            "00001101-0000-1000-8000-00805f9b34fb"
        );
        assert!(!cfg.radio.can_scan);
        assert!(cfg.radio.can_connect);
        assert_eq!(cfg.paired, vec![Device::new("127.0.0.1:40001", Some("bob".to_string()))]);
        assert_eq!(cfg.nearby[0].name, None);
    }

    #[test]
    fn test_deserialize_bad_service_uuid_fails() {
        let result: Result<AppConfig, _> = toml::from_str("[radio]\nservice_uuid = \"nope\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_separator_in_name() {
        let mut cfg = AppConfig::default();
        cfg.node.name = "a#b".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_read_buffer() {
        let mut cfg = AppConfig::default();
        cfg.radio.read_buffer_size = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_read_buffer_smaller_than_max_frame() {
        // Arrange: a maximal frame would be split across two reads.
        let mut cfg = AppConfig::default();
        cfg.radio.read_buffer_size = MAX_FRAME_LEN - 1;

        // Act
        let result = cfg.validate();

        // Assert
        assert!(matches!(result, Err(ConfigError::Invalid(ref msg)) if msg.contains("read_buffer_size")));
    }

    #[test]
    fn test_validate_accepts_read_buffer_of_max_frame_or_more() {
        let mut cfg = AppConfig::default();
        cfg.radio.read_buffer_size = MAX_FRAME_LEN;
        assert!(cfg.validate().is_ok());
        cfg.radio.read_buffer_size = 4 * MAX_FRAME_LEN;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_rejects_small_read_buffer() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("btchat-small-buf-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[radio]\nread_buffer_size = 16\n").unwrap();

        // Act
        let result = load_config(Some(&path));

        // Assert
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_manager_config_mirrors_radio_section() {
        let mut cfg = AppConfig::default();
        cfg.radio.accept_mode = AcceptMode::Repeat;
        cfg.radio.read_buffer_size = 2048;

        let mgr = cfg.manager_config();

        assert_eq!(mgr.accept_mode, AcceptMode::Repeat);
        assert_eq!(mgr.read_buffer_size, 2048);
        assert_eq!(mgr.service_id, ServiceId::DEFAULT);
    }

    #[test]
    fn test_save_and_load_round_trip_via_temp_dir() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("btchat_test_{}", Uuid::new_v4()));
        let path = dir.join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.node.name = "carol".to_string();
        cfg.paired.push(Device::new("127.0.0.1:1", None));

        // Act
        save_config(&cfg, &path).expect("save");
        let loaded = load_config(Some(&path)).expect("load");

        // Assert
        assert_eq!(loaded, cfg);

        // Cleanup
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/config.toml");
        assert_eq!(load_config(Some(&path)).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with("config.toml"), "got {path:?}");
        }
    }
}
