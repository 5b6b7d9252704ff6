//! Configuration types.
//!
//! Everything the bridge persists lives below one data directory, selected
//! by `BRIDGE_DATA_PATH`. The operator-editable settings live in
//! `<data>/cfg.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Environment variable selecting the data directory.
pub const DATA_PATH_ENV: &str = "BRIDGE_DATA_PATH";

const PLACEHOLDER_SERVER: &str = "YourMatrixServerDomain.com";

/// Layout of the data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from `BRIDGE_DATA_PATH` (default `./`),
    /// creating it if it does not exist.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(DATA_PATH_ENV) {
            Ok(raw) if !raw.trim().is_empty() => Self::prepare(&normalize_data_path(&raw)),
            _ => Ok(Self {
                root: PathBuf::from("./"),
            }),
        }
    }

    /// Use `root` as data directory, creating it when missing.
    pub fn prepare(root: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(root) {
            Ok(meta) if !meta.is_dir() => {
                return Err(ConfigError::NotADirectory(root.display().to_string()));
            }
            Ok(_) => {}
            Err(_) => create_private_dir(root)?,
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("cfg.json")
    }

    pub fn database_file(&self) -> PathBuf {
        self.root.join("data.db")
    }

    /// Directory holding downloaded compose attachments.
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Relative paths get a `./` prefix, every path a trailing separator.
fn normalize_data_path(raw: &str) -> PathBuf {
    let mut dir = raw.trim().to_string();
    if !dir.starts_with('/') && !dir.starts_with("./") {
        dir = format!("./{dir}");
    }
    if !dir.ends_with('/') {
        dir.push('/');
    }
    PathBuf::from(dir)
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Operator settings stored in `cfg.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Homeserver base URL or host, e.g. `matrix.org`.
    #[serde(alias = "matrixServer", alias = "matrixserver")]
    pub matrix_server: String,
    #[serde(alias = "matrixuserid")]
    pub matrix_user_id: String,
    #[serde(alias = "matrixuserpassword")]
    pub matrix_user_password: String,
    /// Poll interval in seconds assigned to newly bridged rooms.
    #[serde(alias = "defaultmailCheckInterval")]
    pub default_mail_check_interval: u64,
    #[serde(alias = "markdownEnabledByDefault")]
    pub markdown_enabled_by_default: bool,
    /// Whether new rooms render notifications as HTML.
    #[serde(alias = "htmlDefault")]
    pub html_default: bool,
    /// Server domains whose users may invite the bot.
    pub allowed_servers: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            matrix_server: "matrix.org".to_string(),
            matrix_user_id: "@m:matrix.org".to_string(),
            matrix_user_password: "AverySecretPassword21!".to_string(),
            default_mail_check_interval: 30,
            markdown_enabled_by_default: true,
            html_default: false,
            allowed_servers: vec![PLACEHOLDER_SERVER.to_string()],
        }
    }
}

impl BridgeConfig {
    /// Load `cfg.json` from the data directory.
    ///
    /// A missing file is replaced by the defaults and reported as
    /// [`ConfigError::DefaultWritten`] so the caller can exit. Values that
    /// would be unusable (interval 0, empty server allow-list) are repaired
    /// and written back.
    pub fn load(data: &DataDir) -> Result<Self, ConfigError> {
        let path = data.config_file();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config not found, creating a new one");
                Self::default().save(&path)?;
                return Err(ConfigError::DefaultWritten(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut config: BridgeConfig =
            serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if config.repair() {
            warn!(path = %path.display(), "Config contained unusable values, rewrote defaults");
            config.save(&path)?;
        }
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Fix values that would break the bridge. Returns true if anything changed.
    fn repair(&mut self) -> bool {
        let mut changed = false;
        if self.default_mail_check_interval == 0 {
            self.default_mail_check_interval = 1;
            changed = true;
        }
        if self.allowed_servers.is_empty() {
            self.allowed_servers = vec![PLACEHOLDER_SERVER.to_string()];
            changed = true;
        }
        changed
    }

    /// Whether a user of `server` may invite the bot.
    pub fn is_server_allowed(&self, server: &str) -> bool {
        self.allowed_servers.iter().any(|s| s == server)
    }
}

/// Poll scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Wait between failed connection attempts.
    pub connect_backoff: Duration,
    /// Poll cycles after which a connection is rebuilt.
    pub staleness_threshold: u32,
    /// Consecutive fetch errors that force a reconnect.
    pub error_threshold: u32,
    /// Forced reconnects after which an operational warning is raised.
    pub login_error_warning: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            connect_backoff: Duration::from_secs(60), // 1 minute
            staleness_threshold: 15,
            error_threshold: 10,
            login_error_warning: 15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_data_path_gets_prefix_and_suffix() {
        assert_eq!(normalize_data_path("data"), PathBuf::from("./data/"));
        assert_eq!(normalize_data_path("./data/"), PathBuf::from("./data/"));
        assert_eq!(normalize_data_path("/var/bridge"), PathBuf::from("/var/bridge/"));
    }

    #[test]
    fn missing_config_writes_default() {
        let tmp = tempfile::tempdir().unwrap();
        let data = DataDir::prepare(tmp.path()).unwrap();

        let err = BridgeConfig::load(&data).unwrap_err();
        assert!(matches!(err, ConfigError::DefaultWritten(_)));
        assert!(data.config_file().exists());

        // Second load succeeds with the defaults.
        let config = BridgeConfig::load(&data).unwrap();
        assert_eq!(config.default_mail_check_interval, 30);
        assert!(config.markdown_enabled_by_default);
    }

    #[test]
    fn zero_interval_and_empty_servers_are_repaired() {
        let tmp = tempfile::tempdir().unwrap();
        let data = DataDir::prepare(tmp.path()).unwrap();
        let broken = BridgeConfig {
            default_mail_check_interval: 0,
            allowed_servers: vec![],
            ..BridgeConfig::default()
        };
        broken.save(&data.config_file()).unwrap();

        let config = BridgeConfig::load(&data).unwrap();
        assert_eq!(config.default_mail_check_interval, 1);
        assert_eq!(config.allowed_servers, vec![PLACEHOLDER_SERVER.to_string()]);
    }

    #[test]
    fn legacy_camel_case_keys_are_accepted() {
        let json = r#"{
            "matrixServer": "example.org",
            "matrixuserid": "@bot:example.org",
            "matrixuserpassword": "pw",
            "defaultmailCheckInterval": 45,
            "markdownEnabledByDefault": false,
            "htmlDefault": true,
            "allowed_servers": ["example.org"]
        }"#;
        let config: BridgeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.matrix_server, "example.org");
        assert_eq!(config.default_mail_check_interval, 45);
        assert!(config.html_default);
        assert!(config.is_server_allowed("example.org"));
        assert!(!config.is_server_allowed("evil.org"));
    }

    #[test]
    fn data_dir_rejects_plain_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(
            DataDir::prepare(&file),
            Err(ConfigError::NotADirectory(_))
        ));
    }

    #[test]
    fn data_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let data = DataDir::prepare(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(data.database_file(), nested.join("data.db"));
        assert_eq!(data.temp_dir(), nested.join("temp"));
    }
}
