use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context as _;
use hyper::Uri;
use serde::Deserialize;

use crate::{
    error::{Error, Result},
    proxy::DEFAULT_LISTEN_ADDR,
    replay::DEFAULT_REPLAY_TIMEOUT,
    store::CorruptLinePolicy,
};

pub const PROJECT_CONFIG_FILE: &str = "rwnd.toml";
pub const HOME_CONFIG_DIR: &str = ".rwnd";
pub const HOME_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_LOG_PATH: &str = ".rwnd/logs";

const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 500;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub listen: String,
    pub target: Option<String>,
    pub shutdown_timeout_ms: u64,
    /// Zero disables the proxy-side deadline.
    pub upstream_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDR.to_owned(),
            target: None,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            upstream_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// A log file, or a directory of numbered log files.
    pub log_path: PathBuf,
    pub flush_interval_ms: u64,
    pub corrupt_lines: CorruptLinePolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            corrupt_lines: CorruptLinePolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    pub timeout_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_REPLAY_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Command line values that take precedence over the config file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub target: Option<String>,
    pub log_path: Option<PathBuf>,
}

impl Config {
    /// Loads `override_path` when given, otherwise the first of
    /// `./rwnd.toml` and `$HOME/.rwnd/config.toml` that exists, otherwise the
    /// built-in defaults.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        let home = env::var_os("HOME").map(PathBuf::from);
        Self::load_from(override_path, Path::new("."), home.as_deref())
    }

    fn load_from(
        override_path: Option<&Path>,
        project_dir: &Path,
        home_dir: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let Some((source, path)) = discover(override_path, project_dir, home_dir) else {
            tracing::debug!("no config file found; using defaults");
            return Ok(Self::default());
        };
        let config =
            Self::from_path(&path).with_context(|| format!("load config from {source}"))?;
        tracing::debug!(%source, "loaded config");
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(listen) = &overrides.listen {
            self.proxy.listen = listen.clone();
        }
        if let Some(target) = &overrides.target {
            self.proxy.target = Some(target.clone());
        }
        if let Some(log_path) = &overrides.log_path {
            self.storage.log_path = log_path.clone();
        }
    }

    /// Parsed proxy target, `None` when unset.
    pub fn target_uri(&self) -> Result<Option<Uri>> {
        let Some(raw) = self.proxy.target.as_deref() else {
            return Ok(None);
        };
        raw.trim()
            .parse::<Uri>()
            .map(Some)
            .map_err(|err| Error::configuration(format!("invalid target URL `{raw}`: {err}")))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.shutdown_timeout_ms)
    }

    pub fn upstream_timeout(&self) -> Option<Duration> {
        match self.proxy.upstream_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.storage.flush_interval_ms)
    }

    pub fn replay_timeout(&self) -> Duration {
        Duration::from_millis(self.replay.timeout_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.proxy.listen.trim().is_empty() {
            anyhow::bail!("`proxy.listen` must not be empty");
        }
        if self.storage.log_path.as_os_str().is_empty() {
            anyhow::bail!("`storage.log_path` must not be empty");
        }
        if self.replay.timeout_ms == 0 {
            anyhow::bail!("`replay.timeout_ms` must be greater than zero");
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

fn discover(
    override_path: Option<&Path>,
    project_dir: &Path,
    home_dir: Option<&Path>,
) -> Option<(String, PathBuf)> {
    if let Some(path) = override_path {
        return Some((format!("override {}", path.display()), path.to_path_buf()));
    }

    let project = project_dir.join(PROJECT_CONFIG_FILE);
    if project.is_file() {
        return Some((format!("project ./{PROJECT_CONFIG_FILE}"), project));
    }

    let home = home_dir?.join(HOME_CONFIG_DIR).join(HOME_CONFIG_FILE);
    if !home.is_file() {
        return None;
    }
    Some((format!("home {}", home.display()), home))
}
