use std::{future::Future, io, sync::Arc, time::Duration};

use anyhow::{Context as _, anyhow};
use tokio::{
    io::{AsyncBufRead, BufReader},
    task::JoinError,
};

use crate::{
    config::Config,
    error::Error,
    logger::Logger,
    logpath,
    proxy::{Proxy, ProxyOptions, ShutdownOutcome},
    replay::{ReplayEngine, ReplayOptions},
    store::RecordStore,
};

/// Records traffic between clients and the configured target until
/// `shutdown` resolves or the proxy fails. On the way out the proxy drains
/// in-flight exchanges, the logger drains its queue, then the store closes.
pub async fn run_proxy<F>(config: &Config, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let target = config.target_uri()?.ok_or_else(|| {
        Error::configuration("proxy target is required; pass --target or set [proxy].target")
    })?;
    let log_path = logpath::resolve_record_path(
        &config.storage.log_path,
        &config.proxy.listen,
        Some(&target),
    )
    .context("resolve record log path")?;
    let store = Arc::new(
        RecordStore::open(&log_path, config.flush_interval(), config.storage.corrupt_lines)
            .with_context(|| format!("open record log {}", log_path.display()))?,
    );
    let logger = match Logger::new(store.clone()) {
        Ok(logger) => Arc::new(logger),
        Err(err) => {
            let _ = store.close();
            return Err(err).context("start record logger");
        }
    };

    let proxy = Proxy::new(ProxyOptions {
        listen_addr: Some(config.proxy.listen.clone()),
        target: Some(target),
        logger: Some(logger.clone()),
        upstream_timeout: config.upstream_timeout(),
    });
    let proxy = match proxy {
        Ok(proxy) => Arc::new(proxy),
        Err(err) => {
            let _ = close_pipeline(&logger, &store).await;
            return Err(err).context("configure proxy");
        }
    };
    let listener = match proxy.bind().await {
        Ok(listener) => listener,
        Err(err) => {
            let _ = close_pipeline(&logger, &store).await;
            return Err(err).context("start proxy");
        }
    };
    tracing::info!(log = %store.path().display(), "recording to log file");

    let mut serving = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.serve(listener).await }
    });

    let run_result = tokio::select! {
        joined = &mut serving => serve_result(joined),
        () = shutdown => {
            tracing::info!(deadline = ?config.shutdown_timeout(), "shutting down proxy");
            log_shutdown_outcome(proxy.shutdown(config.shutdown_timeout()).await);
            serve_result(serving.await)
        }
    };

    let close_result = close_pipeline(&logger, &store).await;
    tracing::info!(
        dropped = logger.dropped(),
        log = %store.path().display(),
        "recording finished"
    );

    run_result?;
    close_result
}

/// Replays the resolved log file, stepping interactively on stdin/stdout when
/// `step` is set.
pub async fn run_replay(config: &Config, step: bool) -> anyhow::Result<()> {
    let input = BufReader::new(tokio::io::stdin());
    let mut output = io::stdout();
    replay_log(config, step, input, &mut output).await
}

pub async fn replay_log<R, W>(
    config: &Config,
    step: bool,
    input: R,
    output: &mut W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: io::Write,
{
    let log_path =
        logpath::resolve_replay_path(&config.storage.log_path).context("resolve replay log path")?;
    if !log_path.is_file() {
        anyhow::bail!("log file {} does not exist", log_path.display());
    }
    let store = Arc::new(
        RecordStore::open(&log_path, Duration::ZERO, config.storage.corrupt_lines)
            .with_context(|| format!("open record log {}", log_path.display()))?,
    );
    tracing::info!(log = %log_path.display(), step, "replaying records");

    let mut engine = match ReplayEngine::new(ReplayOptions {
        source: Some(store.clone()),
        timeout: config.replay_timeout(),
    }) {
        Ok(engine) => engine,
        Err(err) => {
            let _ = store.close();
            return Err(err).context("start replay engine");
        }
    };

    let run_result = if step {
        engine.step_loop(input, output).await
    } else {
        engine.replay_all(output).await.map(|_| ())
    };
    let close_result = store.close();

    run_result.context("replay records")?;
    close_result.context("close record log")?;
    Ok(())
}

fn serve_result(joined: Result<crate::error::Result<()>, JoinError>) -> anyhow::Result<()> {
    match joined {
        Ok(result) => result.context("serve proxy"),
        Err(err) => Err(anyhow!("proxy task failed: {err}")),
    }
}

fn log_shutdown_outcome(outcome: ShutdownOutcome) {
    match outcome {
        ShutdownOutcome::Graceful => tracing::info!("proxy drained"),
        ShutdownOutcome::Forced { aborted } => {
            tracing::warn!(aborted, "shutdown deadline passed; closed remaining connections")
        }
    }
}

async fn close_pipeline(logger: &Arc<Logger>, store: &Arc<RecordStore>) -> anyhow::Result<()> {
    let logger = Arc::clone(logger);
    tokio::task::spawn_blocking(move || logger.close())
        .await
        .map_err(|err| anyhow!("record logger close task failed: {err}"))?;
    store.close().context("close record log")
}
