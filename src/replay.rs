use std::{io, io::Write, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt as _, Full};
use hyper::{Method, Request, Uri, header};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _};

use crate::{
    client::{HttpClient, build_http_client},
    error::{Error, Result},
    record::{Headers, Record, RecordedResponse, headers_from_http, headers_to_http},
};

pub const DEFAULT_REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

const PROMPT: &str = "Press Enter for next, r to replay, q to quit > ";

/// Re-readable source of recorded exchanges. Every call starts from the first
/// record; an `Err` item ends the sequence.
pub trait RecordSource: Send + Sync {
    fn stream(&self) -> Box<dyn Iterator<Item = Result<Record>> + Send>;
}

#[derive(Clone)]
pub struct ReplayOptions {
    pub source: Option<Arc<dyn RecordSource>>,
    pub timeout: Duration,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            source: None,
            timeout: DEFAULT_REPLAY_TIMEOUT,
        }
    }
}

/// Steps through stored records and re-issues them against live servers.
pub struct ReplayEngine {
    source: Arc<dyn RecordSource>,
    client: HttpClient,
    timeout: Duration,
    stream: Option<Box<dyn Iterator<Item = Result<Record>> + Send>>,
    done: bool,
}

impl ReplayEngine {
    pub fn new(options: ReplayOptions) -> Result<Self> {
        let source = options
            .source
            .ok_or_else(|| Error::configuration("replay record source is required"))?;
        Ok(Self {
            source,
            client: build_http_client()?,
            timeout: options.timeout,
            stream: None,
            done: false,
        })
    }

    /// Next stored record, or `None` once the stream is exhausted. After
    /// `None` the engine stays at the end until `reset`.
    pub fn step(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        let source = &self.source;
        let stream = self.stream.get_or_insert_with(|| source.stream());
        match stream.next() {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(err)) => Err(err),
            None => {
                self.done = true;
                self.stream = None;
                Ok(None)
            }
        }
    }

    /// Forgets the current position so the next `step` starts over.
    pub fn reset(&mut self) {
        self.stream = None;
        self.done = false;
    }

    /// Sends `record`'s request again and returns a copy carrying the fresh
    /// response and timestamp.
    pub async fn replay(&self, record: &Record) -> Result<Record> {
        let uri: Uri = record.request.url.parse().map_err(|err| {
            Error::Protocol(format!(
                "invalid request URL `{}`: {err}",
                record.request.url
            ))
        })?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(Error::Validation(format!(
                "replay requires an absolute request URL, got `{}`",
                record.request.url
            )));
        }
        let method = Method::from_bytes(record.request.method.as_bytes()).map_err(|err| {
            Error::Protocol(format!(
                "invalid request method `{}`: {err}",
                record.request.method
            ))
        })?;

        let mut request = Request::new(Full::new(Bytes::from(record.request.body.clone())));
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.headers_mut() = headers_to_http(
            &record.request.headers,
            &[header::CONTENT_LENGTH, header::HOST, header::ACCEPT_ENCODING],
        );

        let exchange = async {
            let response = self.client.request(request).await.map_err(Error::network)?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await.map_err(Error::network)?.to_bytes();
            Ok::<_, Error>((parts, body))
        };
        let (parts, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                Error::network(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("replay did not complete within {:?}", self.timeout),
                ))
            })??;

        let mut replayed = record.clone();
        replayed.response = RecordedResponse {
            status: parts.status.as_u16(),
            headers: headers_from_http(&parts.headers),
            body: body.to_vec(),
        };
        replayed.timestamp = Utc::now();
        tracing::debug!(
            id = record.id,
            recorded_status = record.response.status,
            replayed_status = replayed.response.status,
            "replayed record"
        );
        Ok(replayed)
    }

    /// Interactive prompt: Enter steps, `r` replays the current record, `q`
    /// (or end of input) quits.
    pub async fn step_loop<R, W>(&mut self, input: R, output: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = input.lines();
        let mut current: Option<Record> = None;
        loop {
            write!(output, "{PROMPT}")?;
            output.flush()?;
            let Some(line) = lines.next_line().await? else {
                writeln!(output)?;
                return Ok(());
            };

            match line.trim() {
                "q" => return Ok(()),
                "r" => {
                    self.handle_replay(current.as_ref(), output).await?;
                    continue;
                }
                _ => {}
            }

            match self.step()? {
                Some(record) => {
                    write_request(output, &record)?;
                    current = Some(record);
                }
                None => {
                    writeln!(output, "Done")?;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_replay<W: Write>(
        &self,
        current: Option<&Record>,
        output: &mut W,
    ) -> Result<()> {
        let Some(current) = current else {
            writeln!(output, "No record to replay yet")?;
            return Ok(());
        };
        match self.replay(current).await {
            Ok(replayed) => {
                write_response(output, "Old Response", &current.response)?;
                writeln!(output, "---")?;
                write_response(output, "New Response", &replayed.response)?;
            }
            Err(err) => {
                writeln!(output, "Replay error: {err}")?;
            }
        }
        Ok(())
    }

    /// Replays every remaining record in order and prints one status line per
    /// record. Replay failures are reported and do not stop the run.
    pub async fn replay_all<W: Write>(&mut self, output: &mut W) -> Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        while let Some(record) = self.step()? {
            summary.replayed += 1;
            match self.replay(&record).await {
                Ok(replayed) => {
                    let verdict = if same_response(&record.response, &replayed.response) {
                        "same"
                    } else {
                        summary.changed += 1;
                        "changed"
                    };
                    writeln!(
                        output,
                        "#{} {} {}: {} -> {} ({verdict})",
                        record.id,
                        record.request.method,
                        record.request.url,
                        record.response.status,
                        replayed.response.status
                    )?;
                }
                Err(err) => {
                    summary.failed += 1;
                    writeln!(
                        output,
                        "#{} {} {}: replay error: {err}",
                        record.id, record.request.method, record.request.url
                    )?;
                }
            }
        }
        writeln!(
            output,
            "Done: {} replayed, {} changed, {} failed",
            summary.replayed, summary.changed, summary.failed
        )?;
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub changed: usize,
    pub failed: usize,
}

fn same_response(recorded: &RecordedResponse, replayed: &RecordedResponse) -> bool {
    recorded.status == replayed.status && recorded.body == replayed.body
}

fn write_request<W: Write>(output: &mut W, record: &Record) -> io::Result<()> {
    writeln!(output, "Request #{}", record.id)?;
    writeln!(output, "{} {}", record.request.method, record.request.url)?;
    write_headers(output, &record.request.headers)?;
    write_body(output, &record.request.body)
}

fn write_response<W: Write>(
    output: &mut W,
    title: &str,
    response: &RecordedResponse,
) -> io::Result<()> {
    writeln!(output, "{title}")?;
    writeln!(output, "Status: {}", response.status)?;
    write_headers(output, &response.headers)?;
    write_body(output, &response.body)
}

fn write_headers<W: Write>(output: &mut W, headers: &Headers) -> io::Result<()> {
    if headers.is_empty() {
        return Ok(());
    }
    writeln!(output, "Headers:")?;
    for (name, values) in headers {
        for value in values {
            writeln!(output, "  {name}: {value}")?;
        }
    }
    Ok(())
}

fn write_body<W: Write>(output: &mut W, body: &[u8]) -> io::Result<()> {
    if body.is_empty() {
        return Ok(());
    }
    writeln!(output, "Body:")?;
    let text = String::from_utf8_lossy(body);
    writeln!(output, "  {}", text.replace('\n', "\n  "))
}
