use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead as _, BufReader, BufWriter, Write as _},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, mpsc},
    thread,
    time::Duration,
};

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    logger::RecordSink,
    record::Record,
    replay::RecordSource,
};

const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// What `stream` does with a line that does not decode as a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptLinePolicy {
    /// End the stream with a `Protocol` error.
    #[default]
    Abort,
    /// Log and continue with the next line.
    Skip,
}

type SharedWriter = Arc<Mutex<Option<BufWriter<File>>>>;

/// Append-only JSON-lines file of records.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    corrupt_lines: CorruptLinePolicy,
    writer: SharedWriter,
    flusher: Mutex<Option<Flusher>>,
}

#[derive(Debug)]
struct Flusher {
    stop_tx: mpsc::Sender<()>,
    join: thread::JoinHandle<()>,
}

impl RecordStore {
    /// Opens `path` for appending, creating it and its parent directories as
    /// needed. A positive `flush_interval` starts a background flusher.
    pub fn open(
        path: impl Into<PathBuf>,
        flush_interval: Duration,
        corrupt_lines: CorruptLinePolicy,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer: SharedWriter = Arc::new(Mutex::new(Some(BufWriter::with_capacity(
            WRITE_BUFFER_BYTES,
            file,
        ))));

        let flusher = if flush_interval.is_zero() {
            None
        } else {
            Some(spawn_flusher(Arc::clone(&writer), flush_interval, &path)?)
        };

        tracing::debug!(path = %path.display(), ?flush_interval, "opened record store");
        Ok(Self {
            path,
            corrupt_lines,
            writer,
            flusher: Mutex::new(flusher),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &Record) -> Result<()> {
        let mut guard = lock_writer(&self.writer);
        let writer = guard.as_mut().ok_or_else(|| Error::closed("record store"))?;
        serde_json::to_writer(&mut *writer, record).map_err(io::Error::from)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut guard = lock_writer(&self.writer);
        let writer = guard.as_mut().ok_or_else(|| Error::closed("record store"))?;
        writer.flush()?;
        Ok(())
    }

    /// Reads every record written so far, from the beginning of the file.
    pub fn stream(&self) -> RecordStream {
        if let Err(err) = self.flush() {
            return RecordStream::failed(err);
        }
        match File::open(&self.path) {
            Ok(file) => RecordStream::reading(file, self.corrupt_lines),
            Err(err) => RecordStream::failed(err.into()),
        }
    }

    /// Stops the flusher, flushes and closes the file. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(flusher) = flusher {
            let _ = flusher.stop_tx.send(());
            if flusher.join.join().is_err() {
                tracing::warn!(path = %self.path.display(), "record store flusher panicked");
            }
        }

        let Some(writer) = lock_writer(&self.writer).take() else {
            return Ok(());
        };
        let (flush_result, file) = match writer.into_inner() {
            Ok(file) => (Ok(()), Some(file)),
            Err(err) => (Err(err.into_error()), None),
        };
        let close_result = match file {
            Some(file) => file.sync_all(),
            None => Ok(()),
        };

        flush_result?;
        close_result?;
        tracing::debug!(path = %self.path.display(), "closed record store");
        Ok(())
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(path = %self.path.display(), "close record store on drop: {err}");
        }
    }
}

impl RecordSink for RecordStore {
    fn append(&self, record: &Record) -> Result<()> {
        RecordStore::append(self, record)
    }
}

impl RecordSource for RecordStore {
    fn stream(&self) -> Box<dyn Iterator<Item = Result<Record>> + Send> {
        Box::new(RecordStore::stream(self))
    }
}

fn lock_writer(writer: &SharedWriter) -> MutexGuard<'_, Option<BufWriter<File>>> {
    writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_flusher(writer: SharedWriter, interval: Duration, path: &Path) -> Result<Flusher> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let path = path.to_path_buf();
    let join = thread::Builder::new()
        .name("record-store-flush".to_owned())
        .spawn(move || {
            while let Err(mpsc::RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                let mut guard = lock_writer(&writer);
                let Some(buffered) = guard.as_mut() else {
                    return;
                };
                if let Err(err) = buffered.flush() {
                    tracing::warn!(path = %path.display(), "periodic flush failed: {err}");
                }
            }
        })?;
    Ok(Flusher { stop_tx, join })
}

/// Lazy, ordered, finite sequence of stored records.
///
/// A decode or read failure is yielded once as an `Err` item, after which the
/// iterator is exhausted.
#[derive(Debug)]
pub struct RecordStream {
    state: StreamState,
}

#[derive(Debug)]
enum StreamState {
    Failed(Error),
    Reading {
        reader: BufReader<File>,
        line: Vec<u8>,
        line_number: usize,
        corrupt_lines: CorruptLinePolicy,
    },
    Finished,
}

impl RecordStream {
    fn failed(err: Error) -> Self {
        Self {
            state: StreamState::Failed(err),
        }
    }

    fn reading(file: File, corrupt_lines: CorruptLinePolicy) -> Self {
        Self {
            state: StreamState::Reading {
                reader: BufReader::new(file),
                line: Vec::new(),
                line_number: 0,
                corrupt_lines,
            },
        }
    }
}

impl Iterator for RecordStream {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let StreamState::Reading {
                reader,
                line,
                line_number,
                corrupt_lines,
            } = &mut self.state
            else {
                return match std::mem::replace(&mut self.state, StreamState::Finished) {
                    StreamState::Failed(err) => Some(Err(err)),
                    _ => None,
                };
            };

            line.clear();
            match reader.read_until(b'\n', line) {
                Ok(0) => {
                    self.state = StreamState::Finished;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    self.state = StreamState::Finished;
                    return Some(Err(err.into()));
                }
            }
            *line_number += 1;

            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Record>(trimmed) {
                Ok(record) => return Some(Ok(record)),
                Err(err) if *corrupt_lines == CorruptLinePolicy::Skip => {
                    tracing::warn!(line = *line_number, "skipping undecodable record: {err}");
                }
                Err(err) => {
                    let line_number = *line_number;
                    self.state = StreamState::Finished;
                    return Some(Err(Error::Protocol(format!(
                        "decode record at line {line_number}: {err}"
                    ))));
                }
            }
        }
    }
}

impl std::iter::FusedIterator for RecordStream {}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write as _, time::Duration};

    use tempfile::tempdir;

    use super::{CorruptLinePolicy, RecordStore};
    use crate::{error::Error, record::Record};

    fn record(id: u64, path: &str) -> Record {
        let mut record = Record {
            id,
            ..Record::default()
        };
        record.request.method = "GET".to_owned();
        record.request.url = format!("http://upstream.test{path}");
        record.response.status = 200;
        record.response.body = format!("body-{id}").into_bytes();
        record
    }

    fn collect_ok(store: &RecordStore) -> Vec<Record> {
        store
            .stream()
            .collect::<Result<Vec<_>, _>>()
            .expect("stream should decode every record")
    }

    #[test]
    fn stream_yields_appended_records_in_order() {
        let dir = tempdir().expect("tempdir should be created");
        let store = RecordStore::open(
            dir.path().join("log.jsonl"),
            Duration::ZERO,
            CorruptLinePolicy::Abort,
        )
        .expect("store should open");

        let written: Vec<_> = (1..=25).map(|id| record(id, &format!("/r/{id}"))).collect();
        for record in &written {
            store.append(record).expect("append should succeed");
        }

        assert_eq!(collect_ok(&store), written);
        assert_eq!(collect_ok(&store), written, "streams restart from the beginning");
    }

    #[test]
    fn records_survive_close_and_reopen() {
        let dir = tempdir().expect("tempdir should be created");
        let path = dir.path().join("nested").join("log.jsonl");
        let written: Vec<_> = (1..=5).map(|id| record(id, "/durable")).collect();

        let store = RecordStore::open(&path, Duration::ZERO, CorruptLinePolicy::Abort)
            .expect("store should open");
        for record in &written {
            store.append(record).expect("append should succeed");
        }
        store.close().expect("close should succeed");

        let reopened = RecordStore::open(&path, Duration::ZERO, CorruptLinePolicy::Abort)
            .expect("store should reopen");
        assert_eq!(collect_ok(&reopened), written);

        reopened.append(&record(6, "/more")).expect("append after reopen");
        assert_eq!(collect_ok(&reopened).len(), 6);
    }

    #[test]
    fn append_after_close_fails_and_close_is_idempotent() {
        let dir = tempdir().expect("tempdir should be created");
        let store = RecordStore::open(
            dir.path().join("log.jsonl"),
            Duration::from_millis(5),
            CorruptLinePolicy::Abort,
        )
        .expect("store should open");

        store.close().expect("first close should succeed");
        store.close().expect("second close should be a no-op");

        let err = store.append(&record(1, "/late")).unwrap_err();
        assert!(matches!(err, Error::Io(_)), "unexpected error: {err}");

        let mut stream = store.stream();
        assert!(matches!(stream.next(), Some(Err(Error::Io(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn flush_interval_makes_writes_visible_to_other_readers() {
        let dir = tempdir().expect("tempdir should be created");
        let path = dir.path().join("log.jsonl");
        let store = RecordStore::open(&path, Duration::from_millis(10), CorruptLinePolicy::Abort)
            .expect("store should open");
        store.append(&record(1, "/flushed")).expect("append should succeed");

        let mut contents = String::new();
        for _ in 0..200 {
            contents = fs::read_to_string(&path).expect("log should be readable");
            if !contents.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(contents.lines().count(), 1, "contents: {contents}");
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn corrupt_line_aborts_stream_by_default() {
        let dir = tempdir().expect("tempdir should be created");
        let path = dir.path().join("log.jsonl");
        let store = RecordStore::open(&path, Duration::ZERO, CorruptLinePolicy::Abort)
            .expect("store should open");
        store.append(&record(1, "/ok")).expect("append should succeed");
        store.flush().expect("flush should succeed");
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(b"{not json\n"))
            .expect("corrupt line should be written");
        store.append(&record(2, "/after")).expect("append should succeed");

        let items: Vec<_> = store.stream().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().expect("first record decodes").id, 1);
        match &items[1] {
            Err(Error::Protocol(message)) => {
                assert!(message.contains("line 2"), "message: {message}")
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_line_is_skipped_when_tolerant() {
        let dir = tempdir().expect("tempdir should be created");
        let path = dir.path().join("log.jsonl");
        let store = RecordStore::open(&path, Duration::ZERO, CorruptLinePolicy::Skip)
            .expect("store should open");
        store.append(&record(1, "/ok")).expect("append should succeed");
        store.flush().expect("flush should succeed");
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(b"\n{\"ID\":\n"))
            .expect("corrupt line should be written");
        store.append(&record(2, "/after")).expect("append should succeed");

        let ids: Vec<_> = collect_ok(&store).into_iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    fn store_with_torn_utf8(path: &std::path::Path, policy: CorruptLinePolicy) -> RecordStore {
        let store = RecordStore::open(path, Duration::ZERO, policy).expect("store should open");
        store.append(&record(1, "/ok")).expect("append should succeed");
        store.flush().expect("flush should succeed");
        fs::OpenOptions::new()
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(b"{\"ID\":\xe2\x82\n"))
            .expect("torn line should be written");
        store.append(&record(2, "/after")).expect("append should succeed");
        store
    }

    #[test]
    fn invalid_utf8_line_is_skipped_when_tolerant() {
        let dir = tempdir().expect("tempdir should be created");
        let store = store_with_torn_utf8(&dir.path().join("log.jsonl"), CorruptLinePolicy::Skip);

        let ids: Vec<_> = collect_ok(&store).into_iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn invalid_utf8_line_aborts_with_protocol_error() {
        let dir = tempdir().expect("tempdir should be created");
        let store = store_with_torn_utf8(&dir.path().join("log.jsonl"), CorruptLinePolicy::Abort);

        let items: Vec<_> = store.stream().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().expect("first record decodes").id, 1);
        match &items[1] {
            Err(Error::Protocol(message)) => {
                assert!(message.contains("line 2"), "message: {message}")
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_appends_produce_whole_lines() {
        let dir = tempdir().expect("tempdir should be created");
        let store = std::sync::Arc::new(
            RecordStore::open(
                dir.path().join("log.jsonl"),
                Duration::from_millis(1),
                CorruptLinePolicy::Abort,
            )
            .expect("store should open"),
        );

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for n in 0..50 {
                        store
                            .append(&record(worker * 100 + n, "/concurrent"))
                            .expect("append should succeed");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread should finish");
        }

        assert_eq!(collect_ok(&store).len(), 200);
    }
}
