use std::{
    convert::Infallible,
    error::Error as StdError,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    HeaderMap, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
    http::response::Parts as ResponseParts,
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};
use tracing::Instrument as _;

use crate::{
    client::{HttpClient, build_http_client},
    error::{Error, Result},
    record::{Headers, Record, RecordedRequest, RecordedResponse, headers_from_http},
};

pub const DEFAULT_LISTEN_ADDR: &str = ":8080";

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Receiver of completed exchanges. Implementations must not block.
pub trait RecordLogger: Send + Sync {
    fn log_record(&self, record: Record);
}

#[derive(Clone, Default)]
pub struct ProxyOptions {
    /// `host:port`, or `:port` for all interfaces. Defaults to `:8080`.
    pub listen_addr: Option<String>,
    /// Upstream base URL; requests are forwarded beneath its path.
    pub target: Option<Uri>,
    pub logger: Option<Arc<dyn RecordLogger>>,
    /// Deadline for receiving the full upstream response. `None` waits forever.
    pub upstream_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight exchange finished before the deadline.
    Graceful,
    /// The deadline passed and the remaining connections were closed.
    Forced { aborted: usize },
}

/// Reverse proxy that records every exchange with its upstream target.
pub struct Proxy {
    listen_addr: String,
    state: Arc<ProxyState>,
    serving: AtomicBool,
    shutdown_tx: watch::Sender<Option<Duration>>,
    outcome_tx: watch::Sender<Option<ShutdownOutcome>>,
}

struct ProxyState {
    target: Uri,
    logger: Arc<dyn RecordLogger>,
    client: HttpClient,
    upstream_timeout: Option<Duration>,
}

impl Proxy {
    pub fn new(options: ProxyOptions) -> Result<Self> {
        let target = options
            .target
            .ok_or_else(|| Error::configuration("proxy target is required"))?;
        validate_target(&target)?;
        let logger = options
            .logger
            .ok_or_else(|| Error::configuration("proxy logger is required"))?;
        let listen_addr =
            normalize_listen_addr(options.listen_addr.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR));

        let state = Arc::new(ProxyState {
            target,
            logger,
            client: build_http_client()?,
            upstream_timeout: options.upstream_timeout,
        });
        let (shutdown_tx, _) = watch::channel(None);
        let (outcome_tx, _) = watch::channel(None);

        Ok(Self {
            listen_addr,
            state,
            serving: AtomicBool::new(false),
            shutdown_tx,
            outcome_tx,
        })
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn target(&self) -> &Uri {
        &self.state.target
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.listen_addr).await.map_err(|err| {
            Error::Io(io::Error::new(
                err.kind(),
                format!("bind {}: {err}", self.listen_addr),
            ))
        })
    }

    /// Binds the configured address and serves until `shutdown` completes or
    /// accepting fails.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serving.store(true, Ordering::SeqCst);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (drain_tx, drain_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        if let Ok(local_addr) = listener.local_addr() {
            tracing::info!(
                listen_addr = %local_addr,
                target = %self.state.target,
                "proxy listening"
            );
        }

        let deadline = loop {
            let requested = *shutdown_rx.borrow_and_update();
            if let Some(deadline) = requested {
                break deadline;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            connections.spawn(serve_connection(
                                stream,
                                peer,
                                Arc::clone(&self.state),
                                drain_rx.clone(),
                            ));
                        }
                        Err(err) if is_connection_error(&err) => {
                            tracing::debug!("accept connection: {err}");
                        }
                        Err(err) => {
                            tracing::error!("accept failed, stopping proxy: {err}");
                            let aborted = connections.len();
                            connections.abort_all();
                            self.outcome_tx
                                .send_replace(Some(ShutdownOutcome::Forced { aborted }));
                            return Err(err.into());
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        drop(listener);
        let in_flight = connections.len();
        tracing::info!(in_flight, ?deadline, "proxy shutting down");
        let _ = drain_tx.send(true);

        let drained = tokio::time::timeout(deadline, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        let outcome = match drained {
            Ok(()) => ShutdownOutcome::Graceful,
            Err(_) => {
                let aborted = connections.len();
                connections.abort_all();
                tracing::warn!(aborted, "shutdown deadline passed, closing connections");
                ShutdownOutcome::Forced { aborted }
            }
        };
        self.outcome_tx.send_replace(Some(outcome));
        Ok(())
    }

    /// Stops accepting connections and waits up to `deadline` for in-flight
    /// exchanges before closing what remains.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownOutcome {
        let mut outcome_rx = self.outcome_tx.subscribe();
        self.shutdown_tx.send_replace(Some(deadline));
        if !self.serving.load(Ordering::SeqCst) {
            return ShutdownOutcome::Graceful;
        }
        match outcome_rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(ShutdownOutcome::Graceful),
            Err(_) => ShutdownOutcome::Graceful,
        }
    }
}

fn validate_target(target: &Uri) -> Result<()> {
    if !matches!(target.scheme_str(), Some("http" | "https")) {
        return Err(Error::configuration(format!(
            "proxy target `{target}` must use http or https"
        )));
    }
    if target.authority().is_none() {
        return Err(Error::configuration(format!(
            "proxy target `{target}` must include a host"
        )));
    }
    Ok(())
}

pub(crate) fn normalize_listen_addr(addr: &str) -> String {
    let addr = addr.trim();
    let addr = if addr.is_empty() { DEFAULT_LISTEN_ADDR } else { addr };
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_owned(),
    }
}

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ProxyState>,
    mut drain_rx: watch::Receiver<bool>,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| proxy_handler(req, peer, Arc::clone(&state)));
    let builder = ConnectionBuilder::new(TokioExecutor::new());
    let connection = builder.serve_connection(io, service);
    tokio::pin!(connection);

    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(err) = result {
                    tracing::debug!(%peer, "connection error: {err}");
                }
                break;
            }
            _ = drain_rx.changed(), if !draining => {
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

async fn proxy_handler(
    req: Request<Incoming>,
    peer: SocketAddr,
    state: Arc<ProxyState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let span = tracing::info_span!(
        "proxy.request",
        method = %req.method(),
        url = %req.uri(),
    );
    Ok(handle_exchange(req, peer, state).instrument(span).await)
}

async fn handle_exchange(
    req: Request<Incoming>,
    peer: SocketAddr,
    state: Arc<ProxyState>,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::warn!("read request body: {err}");
            return simple_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let upstream_uri = match resolve_upstream_uri(&state.target, &parts.uri) {
        Ok(uri) => uri,
        Err(err) => {
            tracing::warn!("{err}");
            return simple_response(StatusCode::BAD_REQUEST, "invalid request target");
        }
    };

    let mut record = Record {
        request: capture_request(&parts, &upstream_uri, &body),
        ..Record::default()
    };

    let mut headers = parts.headers;
    strip_hop_by_hop_headers(&mut headers);
    append_forwarded_for(&mut headers, peer);
    set_host_header(&mut headers, &upstream_uri);

    let mut upstream_req = Request::new(Full::new(body));
    *upstream_req.method_mut() = parts.method;
    *upstream_req.uri_mut() = upstream_uri.clone();
    *upstream_req.headers_mut() = headers;

    let exchange = send_upstream_request(&state.client, upstream_req);
    let result = match state.upstream_timeout {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .unwrap_or_else(|_| {
                Err(Error::network(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("upstream did not respond within {limit:?}"),
                )))
            }),
        None => exchange.await,
    };

    match result {
        Ok((mut parts, body)) => {
            strip_hop_by_hop_headers(&mut parts.headers);
            record.response = RecordedResponse {
                status: parts.status.as_u16(),
                headers: headers_from_http(&parts.headers),
                body: body.to_vec(),
            };
            record.timestamp = Utc::now();
            state.logger.log_record(record);
            Response::from_parts(parts, Full::new(body))
        }
        Err(err) => {
            let message = error_chain(&err);
            tracing::warn!(upstream = %upstream_uri, "upstream request failed: {message}");
            record.response = RecordedResponse {
                status: StatusCode::BAD_GATEWAY.as_u16(),
                headers: Headers::new(),
                body: message.clone().into_bytes(),
            };
            record.timestamp = Utc::now();
            state.logger.log_record(record);
            simple_response(StatusCode::BAD_GATEWAY, &message)
        }
    }
}

async fn send_upstream_request(
    client: &HttpClient,
    upstream_req: Request<Full<Bytes>>,
) -> Result<(ResponseParts, Bytes)> {
    let response = client.request(upstream_req).await.map_err(Error::network)?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await.map_err(Error::network)?.to_bytes();
    Ok((parts, body))
}

fn capture_request(
    parts: &hyper::http::request::Parts,
    upstream_uri: &Uri,
    body: &Bytes,
) -> RecordedRequest {
    let mut headers = headers_from_http(&parts.headers);
    let effective_host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or_else(|| parts.uri.authority().map(|authority| authority.to_string()));
    if let Some(host) = effective_host {
        headers.insert("Host".to_owned(), vec![host]);
    }

    RecordedRequest {
        method: parts.method.to_string(),
        url: upstream_uri.to_string(),
        headers,
        body: body.to_vec(),
    }
}

/// Target scheme and authority, target path joined to the request path with a
/// single slash, target query joined to the request query with `&`.
pub(crate) fn resolve_upstream_uri(target: &Uri, original: &Uri) -> Result<Uri> {
    let path = join_paths(target.path(), original.path());
    let query = match (
        target.query().filter(|query| !query.is_empty()),
        original.query().filter(|query| !query.is_empty()),
    ) {
        (Some(target_query), Some(request_query)) => {
            Some(format!("{target_query}&{request_query}"))
        }
        (Some(query), None) | (None, Some(query)) => Some(query.to_owned()),
        (None, None) => None,
    };
    let path_and_query = match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };

    let mut parts = target.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse().map_err(|err| {
        Error::Validation(format!("invalid request target `{original}`: {err}"))
    })?);
    Uri::from_parts(parts)
        .map_err(|err| Error::Validation(format!("construct upstream uri: {err}")))
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

fn set_host_header(headers: &mut HeaderMap, uri: &Uri) {
    let Some(authority) = uri.authority() else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
        headers.insert(header::HOST, value);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let client_ip = peer.ip().to_string();
    let value = {
        let prior: Vec<&str> = headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        if prior.is_empty() {
            client_ip
        } else {
            format!("{}, {client_ip}", prior.join(", "))
        }
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }

    for header_name in to_remove {
        headers.remove(header_name);
    }

    const STANDARD: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in STANDARD {
        headers.remove(*header_name);
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = match err.downcast_ref::<Error>() {
        Some(Error::Network(inner)) => inner.to_string(),
        _ => err.to_string(),
    };
    let mut source = match err.downcast_ref::<Error>() {
        Some(Error::Network(inner)) => inner.source(),
        _ => err.source(),
    };
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn simple_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}
