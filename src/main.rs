use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rwnd::{
    app,
    config::{CliOverrides, Config},
    logging,
};

#[derive(Debug, Parser)]
#[command(
    name = "rwnd",
    about = "Local HTTP traffic recorder and replay tool",
    after_help = "Examples:\n  \
                  rwnd proxy --listen :8080 --target http://localhost:3000\n  \
                  rwnd replay --step"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the reverse proxy and record traffic.
    Proxy {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Address to listen on (`host:port`, or `:port` for all interfaces).
        #[arg(long)]
        listen: Option<String>,
        /// Upstream target URL.
        #[arg(long)]
        target: Option<String>,
        /// Log file, or directory for numbered log files.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Replay recorded traffic.
    Replay {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Log file, or directory whose latest numbered log is replayed.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Step through records interactively.
        #[arg(long)]
        step: bool,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Proxy {
            config,
            listen,
            target,
            log,
            log_level,
        } => {
            let mut config = Config::load(config.as_deref())?;
            config.apply_overrides(&CliOverrides {
                listen,
                target,
                log_path: log,
            });
            logging::init(&config, log_level.as_deref())?;
            app::run_proxy(&config, async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!("listen for ctrl-c: {err}");
                }
            })
            .await?;
        }
        Command::Replay {
            config,
            log,
            step,
            log_level,
        } => {
            let mut config = Config::load(config.as_deref())?;
            config.apply_overrides(&CliOverrides {
                log_path: log,
                ..CliOverrides::default()
            });
            logging::init(&config, log_level.as_deref())?;
            app::run_replay(&config, step).await?;
        }
    }

    Ok(())
}
