use std::io;

use anyhow::anyhow;
use tracing::Dispatch;
use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter};

use crate::config::{Config, LogFormat};

const LEVEL_NAMES: &str = "trace, debug, info, warn, error, off";

/// Resolved diagnostics settings. The CLI level wins over `[logging].level`,
/// which wins over `info`. Format defaults to JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn resolve(config: &Config, cli_level: Option<&str>) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();
        let level = match cli_level.or_else(|| logging.and_then(|l| l.level.as_deref())) {
            Some(raw) => parse_level(raw)?,
            None => LevelFilter::INFO,
        };
        let format = logging
            .and_then(|logging| logging.format)
            .unwrap_or(LogFormat::Json);
        Ok(Self { level, format })
    }

    /// Builds a dispatcher that writes every event to `writer`.
    pub fn dispatch<W>(&self, writer: W) -> Dispatch
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let builder = tracing_subscriber::fmt()
            .with_max_level(self.level)
            .with_target(true)
            .with_writer(writer);
        match self.format {
            LogFormat::Json => Dispatch::new(builder.json().finish()),
            LogFormat::Pretty => Dispatch::new(builder.pretty().finish()),
        }
    }
}

/// Installs the process-wide subscriber on stderr, leaving stdout to the
/// replay view.
pub fn init(config: &Config, cli_level: Option<&str>) -> anyhow::Result<()> {
    let settings = LogSettings::resolve(config, cli_level)?;
    tracing::dispatcher::set_global_default(settings.dispatch(io::stderr))
        .map_err(|err| anyhow!("install diagnostics subscriber: {err}"))
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    raw.trim()
        .to_ascii_lowercase()
        .parse()
        .map_err(|_| anyhow!("invalid log level `{raw}`; expected one of {LEVEL_NAMES}"))
}
