use std::{error::Error as _, io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{TimeZone as _, Utc};
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use rwnd::{
    Error,
    record::Record,
    replay::{ReplayEngine, ReplayOptions},
    store::{CorruptLinePolicy, RecordStore},
};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};

#[derive(Debug)]
struct SeenRequest {
    method: String,
    path_and_query: String,
    headers: hyper::HeaderMap,
    body: Bytes,
}

fn recorded(id: u64, url: String) -> Record {
    let mut record = Record {
        id,
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ..Record::default()
    };
    record.request.method = "PUT".to_owned();
    record.request.url = url;
    record.request.body = b"payload".to_vec();
    for (name, value) in [
        ("Host", "stale.invalid"),
        ("Content-Length", "999"),
        ("Accept-Encoding", "gzip"),
        ("X-Trace", "abc"),
    ] {
        record
            .request
            .headers
            .insert(name.to_owned(), vec![value.to_owned()]);
    }
    record.response.status = 500;
    record.response.body = b"old failure".to_vec();
    record
}

fn store_with(records: &[Record]) -> (TempDir, Arc<RecordStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = RecordStore::open(
        dir.path().join("capture.jsonl"),
        Duration::ZERO,
        CorruptLinePolicy::Abort,
    )
    .expect("store should open");
    for record in records {
        store.append(record).expect("append should succeed");
    }
    (dir, Arc::new(store))
}

fn engine(store: Arc<RecordStore>, timeout: Duration) -> ReplayEngine {
    ReplayEngine::new(ReplayOptions {
        source: Some(store),
        timeout,
    })
    .expect("engine should build")
}

#[tokio::test]
async fn replay_resends_request_and_refreshes_response() {
    let (addr, mut seen_rx, server) = spawn_echo(Duration::ZERO).await;
    let original = recorded(4, format!("http://{addr}/items?id=3"));
    let (_dir, store) = store_with(std::slice::from_ref(&original));
    let mut engine = engine(store, Duration::from_secs(5));

    let record = engine.step().unwrap().expect("stored record");
    assert_eq!(record, original);
    let replayed = engine.replay(&record).await.expect("replay should succeed");

    assert_eq!(replayed.id, original.id);
    assert_eq!(replayed.request, original.request);
    assert!(replayed.timestamp > original.timestamp);
    assert_eq!(replayed.response.status, 200);
    assert_eq!(replayed.response.body, b"echo:payload");
    assert_eq!(
        replayed.response.headers.get("X-Echo-Method"),
        Some(&vec!["PUT".to_owned()])
    );

    let seen = seen_rx.recv().await.expect("server should see replay");
    assert_eq!(seen.method, "PUT");
    assert_eq!(seen.path_and_query, "/items?id=3");
    assert_eq!(seen.body.as_ref(), b"payload");
    assert_eq!(seen.headers.get("x-trace").unwrap(), "abc");
    assert_eq!(
        seen.headers.get(header::HOST).unwrap(),
        addr.to_string().as_str()
    );
    assert_eq!(seen.headers.get(header::CONTENT_LENGTH).unwrap(), "7");
    assert!(seen.headers.get(header::ACCEPT_ENCODING).is_none());

    server.abort();
}

#[tokio::test]
async fn replay_surfaces_network_errors() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = closed.local_addr().unwrap();
    drop(closed);

    let (_dir, store) = store_with(&[]);
    let engine = engine(store, Duration::from_secs(5));
    let err = engine
        .replay(&recorded(1, format!("http://{dead_addr}/")))
        .await
        .expect_err("connection should be refused");
    assert!(matches!(err, Error::Network(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn replay_times_out() {
    let (addr, _seen_rx, server) = spawn_echo(Duration::from_secs(10)).await;
    let (_dir, store) = store_with(&[]);
    let engine = engine(store, Duration::from_millis(100));

    let err = engine
        .replay(&recorded(1, format!("http://{addr}/slow")))
        .await
        .expect_err("replay should time out");
    let Error::Network(source) = &err else {
        panic!("unexpected error: {err}");
    };
    let io_err = source
        .downcast_ref::<io::Error>()
        .expect("timeout should be an io error");
    assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    assert!(err.source().is_some());

    server.abort();
}

#[tokio::test]
async fn step_loop_shows_old_and_new_response() {
    let (addr, _seen_rx, server) = spawn_echo(Duration::ZERO).await;
    let (_dir, store) = store_with(&[recorded(1, format!("http://{addr}/items"))]);
    let mut engine = engine(store, Duration::from_secs(5));

    let mut output = Vec::new();
    engine
        .step_loop(&b"\nr\n\n"[..], &mut output)
        .await
        .expect("loop should finish");
    let output = String::from_utf8(output).unwrap();

    let old_at = output.find("Old Response\nStatus: 500\n").expect(&output);
    let sep_at = output.find("\n---\n").expect(&output);
    let new_at = output.find("New Response\nStatus: 200\n").expect(&output);
    assert!(old_at < sep_at && sep_at < new_at, "{output}");
    assert!(output.contains("  old failure\n"), "{output}");
    assert!(output.contains("  echo:payload\n"), "{output}");
    assert!(output.contains("  X-Echo-Method: PUT\n"), "{output}");
    assert!(output.ends_with("Done\n"), "{output}");

    server.abort();
}

#[tokio::test]
async fn replay_all_compares_every_record() {
    let (addr, _seen_rx, server) = spawn_echo(Duration::ZERO).await;
    let mut unchanged = recorded(2, format!("http://{addr}/same"));
    unchanged.response.status = 200;
    unchanged.response.body = b"echo:payload".to_vec();
    let (_dir, store) = store_with(&[
        recorded(1, format!("http://{addr}/changed")),
        unchanged,
        recorded(3, "/relative".to_owned()),
    ]);
    let mut engine = engine(store, Duration::from_secs(5));

    let mut output = Vec::new();
    let summary = engine
        .replay_all(&mut output)
        .await
        .expect("replay_all should finish");
    let output = String::from_utf8(output).unwrap();

    assert_eq!(summary.replayed, 3);
    assert_eq!(summary.changed, 1);
    assert_eq!(summary.failed, 1);
    assert!(output.contains("#1 PUT"), "{output}");
    assert!(output.contains("500 -> 200 (changed)"), "{output}");
    assert!(output.contains("200 -> 200 (same)"), "{output}");
    assert!(output.contains("#3 PUT /relative: replay error"), "{output}");

    server.abort();
}

async fn spawn_echo(
    delay: Duration,
) -> (SocketAddr, mpsc::UnboundedReceiver<SeenRequest>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    let join = tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = tx.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await?.to_bytes();
                        let _ = tx.send(SeenRequest {
                            method: parts.method.to_string(),
                            path_and_query: parts
                                .uri
                                .path_and_query()
                                .map(ToString::to_string)
                                .unwrap_or_default(),
                            headers: parts.headers,
                            body: body.clone(),
                        });
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }

                        let mut echoed = b"echo:".to_vec();
                        echoed.extend_from_slice(&body);
                        let mut res = Response::new(Full::new(Bytes::from(echoed)));
                        *res.status_mut() = StatusCode::OK;
                        res.headers_mut().insert(
                            "x-echo-method",
                            HeaderValue::from_str(parts.method.as_str()).unwrap(),
                        );
                        Ok::<_, hyper::Error>(res)
                    }
                });
                let builder = ConnectionBuilder::new(TokioExecutor::new());
                let _ = builder
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, rx, join)
}
