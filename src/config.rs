//! Layered configuration for a site worker.
//!
//! Settings are resolved once at start-up from, in increasing priority:
//! 1. `fedrun.toml` (explicit `--config` path, or `./fedrun.toml` when present)
//! 2. Environment variables (a `.env` file is loaded first)
//! 3. Command-line overrides
//!
//! # Configuration File Format
//!
//! ```toml
//! [router]
//! url = "https://router.example.org"
//! username = "site-a"
//! password = "secret"
//! timeout_secs = 30
//!
//! [site]
//! uid = "site-a"
//! artifact_root = "/var/lib/fedrun/artifacts"
//! state_dir = "/var/lib/fedrun"
//!
//! [dispatch]
//! poll_interval_secs = 10
//! monitor_interval_secs = 60
//! partitions = 4
//! step_timeout_secs = 1800
//!
//! [cache]
//! backend = "file"
//! ttl_secs = 86400
//! reset_on_start = true
//!
//! [logging]
//! format = "json"
//! file = "/var/log/fedrun/worker.log"
//! ```

use crate::errors::ConfigError;
use crate::observability::LogFormat;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "fedrun.toml";

pub const ENV_ROUTER_URL: &str = "ROUTER_URL";
pub const ENV_ROUTER_USERNAME: &str = "ROUTER_USERNAME";
pub const ENV_ROUTER_PASSWORD: &str = "ROUTER_PASSWORD";
pub const ENV_SITE_UID: &str = "SITE_UID";
pub const ENV_ARTIFACT_ROOT: &str = "FEDRUN_ARTIFACT_ROOT";
pub const ENV_STATE_DIR: &str = "FEDRUN_STATE_DIR";

/// Router connection settings in `[router]`.
#[derive(Clone, Serialize, Deserialize)]
pub struct RouterSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Upper bound on a single router request
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for RouterSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterSection")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Local site identity and storage in `[site]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteSection {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub artifact_root: Option<PathBuf>,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// Detection and execution tuning in `[dispatch]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Number of execution partitions (one serial worker each)
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    /// Upper bound on one state-machine step, task work included
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Buffered dispatches per partition before enqueueing waits
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_monitor_interval_secs() -> u64 {
    60
}

fn default_partitions() -> usize {
    4
}

fn default_step_timeout_secs() -> u64 {
    30 * 60
}

fn default_queue_depth() -> usize {
    64
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            partitions: default_partitions(),
            step_timeout_secs: default_step_timeout_secs(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Backend holding the status snapshots used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Process-local map; lost on restart
    #[default]
    Memory,
    /// One JSON document per run under `{state_dir}/cache`
    File,
}

impl std::fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheBackend::Memory => write!(f, "memory"),
            CacheBackend::File => write!(f, "file"),
        }
    }
}

impl std::str::FromStr for CacheBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(CacheBackend::Memory),
            "file" => Ok(CacheBackend::File),
            _ => anyhow::bail!("Invalid cache backend '{}'. Valid values: memory, file", s),
        }
    }
}

/// Status cache settings in `[cache]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default)]
    pub backend: CacheBackend,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Clear every cached snapshot when the worker boots
    #[serde(default = "default_reset_on_start")]
    pub reset_on_start: bool,
}

fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_reset_on_start() -> bool {
    true
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            ttl_secs: default_ttl_secs(),
            reset_on_start: default_reset_on_start(),
        }
    }
}

/// Log output settings in `[logging]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Also write logs to this file, rotated daily
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// The complete fedrun.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FedrunToml {
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl FedrunToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse fedrun.toml")
    }

    /// Load from `dir/fedrun.toml`, or defaults when the file does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize fedrun.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

/// Values given on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub site_uid: Option<String>,
    pub router_url: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
}

/// Resolved router connection.
#[derive(Clone)]
pub struct RouterSettings {
    pub url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for RouterSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterSettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Runtime configuration shared (by `Arc`) across the router client, the
/// dispatcher and the run state machine.
#[derive(Debug, Clone)]
pub struct Config {
    pub site_uid: String,
    pub router: RouterSettings,
    pub artifact_root: PathBuf,
    pub state_dir: PathBuf,
    pub poll_interval: Duration,
    pub monitor_interval: Duration,
    pub partitions: usize,
    pub step_timeout: Duration,
    pub queue_depth: usize,
    pub cache_backend: CacheBackend,
    pub cache_ttl: Duration,
    pub reset_cache_on_start: bool,
    pub log_format: LogFormat,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Resolve configuration from the process environment.
    ///
    /// `config_path` must exist when given; otherwise `./fedrun.toml` is used
    /// if present.
    pub fn load(config_path: Option<&Path>, overrides: &CliOverrides) -> Result<Self> {
        let config = Self::resolve(config_path, overrides)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`] but without validation, for display.
    pub fn resolve(config_path: Option<&Path>, overrides: &CliOverrides) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match config_path {
            Some(path) => FedrunToml::load(path)?,
            None => {
                let cwd = std::env::current_dir().context("Failed to get current directory")?;
                FedrunToml::load_or_default(&cwd)?
            }
        };

        Ok(Self::from_sources(
            file,
            |key| std::env::var(key).ok(),
            overrides,
        ))
    }

    /// Merge file values, an environment lookup and CLI overrides.
    /// Does not validate.
    pub fn from_sources<F>(file: FedrunToml, env: F, overrides: &CliOverrides) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |cli: Option<String>, key: &str, from_file: Option<String>| {
            cli.or_else(|| env(key).filter(|v| !v.is_empty()))
                .or(from_file)
                .unwrap_or_default()
        };

        let site_uid = pick(overrides.site_uid.clone(), ENV_SITE_UID, file.site.uid);
        let url = pick(overrides.router_url.clone(), ENV_ROUTER_URL, file.router.url);
        let username = pick(None, ENV_ROUTER_USERNAME, file.router.username);
        let password = pick(None, ENV_ROUTER_PASSWORD, file.router.password);

        let state_dir = overrides
            .state_dir
            .clone()
            .or_else(|| env(ENV_STATE_DIR).map(PathBuf::from))
            .or(file.site.state_dir)
            .unwrap_or_else(default_state_dir);
        let artifact_root = env(ENV_ARTIFACT_ROOT)
            .map(PathBuf::from)
            .or(file.site.artifact_root)
            .unwrap_or_else(|| state_dir.join("artifacts"));

        Self {
            site_uid,
            router: RouterSettings {
                url: url.trim_end_matches('/').to_string(),
                username,
                password,
                timeout: Duration::from_secs(file.router.timeout_secs),
            },
            artifact_root,
            state_dir,
            poll_interval: Duration::from_secs(file.dispatch.poll_interval_secs),
            monitor_interval: Duration::from_secs(file.dispatch.monitor_interval_secs),
            partitions: file.dispatch.partitions,
            step_timeout: Duration::from_secs(file.dispatch.step_timeout_secs),
            queue_depth: file.dispatch.queue_depth,
            cache_backend: file.cache.backend,
            cache_ttl: Duration::from_secs(file.cache.ttl_secs),
            reset_cache_on_start: file.cache.reset_on_start,
            log_format: overrides.log_format.unwrap_or(file.logging.format),
            log_file: file.logging.file,
        }
    }

    /// Configuration for a site that talks to an in-process router, rooted at
    /// `state_dir`. Used by `fedrun simulate`.
    pub fn local(site_uid: &str, state_dir: &Path) -> Self {
        let overrides = CliOverrides {
            site_uid: Some(site_uid.to_string()),
            router_url: Some("memory://local".to_string()),
            state_dir: Some(state_dir.to_path_buf()),
            log_format: None,
        };
        Self::from_sources(FedrunToml::default(), |_| None, &overrides)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.site_uid.trim().is_empty() {
            return Err(ConfigError::Missing {
                setting: "site_uid",
                env: ENV_SITE_UID,
                section: "site",
            });
        }
        if self.router.url.trim().is_empty() {
            return Err(ConfigError::Missing {
                setting: "router.url",
                env: ENV_ROUTER_URL,
                section: "router",
            });
        }
        let nonzero = [
            ("dispatch.poll_interval_secs", self.poll_interval.is_zero()),
            ("dispatch.monitor_interval_secs", self.monitor_interval.is_zero()),
            ("dispatch.step_timeout_secs", self.step_timeout.is_zero()),
            ("router.timeout_secs", self.router.timeout.is_zero()),
            ("cache.ttl_secs", self.cache_ttl.is_zero()),
        ];
        if let Some((setting, _)) = nonzero.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Invalid {
                setting: *setting,
                message: "must be greater than zero".to_string(),
            });
        }
        if self.partitions == 0 {
            return Err(ConfigError::Invalid {
                setting: "dispatch.partitions",
                message: "at least one execution partition is required".to_string(),
            });
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid {
                setting: "dispatch.queue_depth",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Directory holding file-backed status snapshots.
    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.artifact_root)
            .with_context(|| format!("Failed to create {}", self.artifact_root.display()))?;
        if self.cache_backend == CacheBackend::File {
            std::fs::create_dir_all(self.cache_dir())
                .context("Failed to create cache directory")?;
        }
        Ok(())
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("fedrun"))
        .unwrap_or_else(|| PathBuf::from(".fedrun"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_full_file() {
        let toml = FedrunToml::parse(
            r#"
            [router]
            url = "https://router.example.org/"
            username = "alice"
            password = "pw"

            [site]
            uid = "site-a"

            [dispatch]
            poll_interval_secs = 5
            partitions = 8

            [cache]
            backend = "file"
            "#,
        )
        .unwrap();
        assert_eq!(toml.router.url.as_deref(), Some("https://router.example.org/"));
        assert_eq!(toml.router.timeout_secs, 30);
        assert_eq!(toml.dispatch.poll_interval_secs, 5);
        assert_eq!(toml.dispatch.monitor_interval_secs, 60);
        assert_eq!(toml.dispatch.partitions, 8);
        assert_eq!(toml.cache.backend, CacheBackend::File);
        assert_eq!(toml.cache.ttl_secs, 86_400);
    }

    #[test]
    fn test_env_overrides_file_and_cli_overrides_env() {
        let mut file = FedrunToml::default();
        file.site.uid = Some("from-file".to_string());
        file.router.url = Some("http://file-router".to_string());

        let env = env_from(&[(ENV_SITE_UID, "from-env"), (ENV_ROUTER_URL, "http://env-router/")]);
        let config = Config::from_sources(file.clone(), &env, &CliOverrides::default());
        assert_eq!(config.site_uid, "from-env");
        assert_eq!(config.router.url, "http://env-router");

        let overrides = CliOverrides {
            site_uid: Some("from-cli".to_string()),
            ..Default::default()
        };
        let config = Config::from_sources(file, &env, &overrides);
        assert_eq!(config.site_uid, "from-cli");
    }

    #[test]
    fn test_empty_env_value_falls_through() {
        let mut file = FedrunToml::default();
        file.site.uid = Some("from-file".to_string());
        let config =
            Config::from_sources(file, env_from(&[(ENV_SITE_UID, "")]), &CliOverrides::default());
        assert_eq!(config.site_uid, "from-file");
    }

    #[test]
    fn test_artifact_root_defaults_under_state_dir() {
        let dir = tempdir().unwrap();
        let config = Config::local("site-a", dir.path());
        assert_eq!(config.artifact_root, dir.path().join("artifacts"));
        assert_eq!(config.cache_dir(), dir.path().join("cache"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_site_uid() {
        let config = Config::from_sources(
            FedrunToml::default(),
            env_from(&[(ENV_ROUTER_URL, "http://router")]),
            &CliOverrides::default(),
        );
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing { setting: "site_uid", .. }));
    }

    #[test]
    fn test_validate_requires_router_url() {
        let config = Config::from_sources(
            FedrunToml::default(),
            env_from(&[(ENV_SITE_UID, "site-a")]),
            &CliOverrides::default(),
        );
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing { setting: "router.url", .. }));
    }

    #[test]
    fn test_validate_rejects_zero_partitions() {
        let dir = tempdir().unwrap();
        let mut config = Config::local("site-a", dir.path());
        config.partitions = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { setting: "dispatch.partitions", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let dir = tempdir().unwrap();
        let mut config = Config::local("site-a", dir.path());
        config.poll_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { setting: "dispatch.poll_interval_secs", .. })
        ));
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut toml = FedrunToml::default();
        toml.site.uid = Some("site-z".to_string());
        toml.cache.backend = CacheBackend::File;
        toml.save(&path).unwrap();

        let loaded = FedrunToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.site.uid.as_deref(), Some("site-z"));
        assert_eq!(loaded.cache.backend, CacheBackend::File);
    }

    #[test]
    fn test_debug_redacts_password() {
        let dir = tempdir().unwrap();
        let mut config = Config::local("site-a", dir.path());
        config.router.password = "hunter2".to_string();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_cache_backend_from_str() {
        assert_eq!("FILE".parse::<CacheBackend>().unwrap(), CacheBackend::File);
        assert!("redis".parse::<CacheBackend>().is_err());
    }
}
