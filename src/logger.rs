use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{error::Result, proxy::RecordLogger, record::Record};

pub const QUEUE_CAPACITY: usize = 1024;

/// Durable destination for logged records.
pub trait RecordSink: Send + Sync {
    fn append(&self, record: &Record) -> Result<()>;
}

/// Assigns IDs and timestamps to records and hands them to a single
/// background writer without ever blocking the caller.
#[derive(Debug)]
pub struct Logger {
    sender: RwLock<Option<mpsc::Sender<Record>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl Logger {
    pub fn new(sink: Arc<dyn RecordSink>) -> Result<Self> {
        Self::with_capacity(sink, QUEUE_CAPACITY)
    }

    pub fn with_capacity(sink: Arc<dyn RecordSink>, capacity: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = thread::Builder::new()
            .name("record-logger".to_owned())
            .spawn(move || drain(receiver, sink.as_ref()))?;

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            next_id: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Stamps `record` and queues it. Returns the assigned ID, or `None` when
    /// the queue is full or the logger is closed and the record was dropped.
    pub fn log(&self, mut record: Record) -> Option<u64> {
        record.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        record.timestamp = Utc::now();
        let id = record.id;

        let sender = self
            .sender
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = sender.as_ref() else {
            self.record_drop(id, "logger closed");
            return None;
        };
        match sender.try_send(record) {
            Ok(()) => Some(id),
            Err(TrySendError::Full(_)) => {
                self.record_drop(id, "queue full");
                None
            }
            Err(TrySendError::Closed(_)) => {
                self.record_drop(id, "worker stopped");
                None
            }
        }
    }

    /// Number of records dropped instead of queued.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops accepting records and blocks until every queued record has been
    /// appended. Every caller returns only after the drain has finished.
    pub fn close(&self) {
        let mut worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.sender
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker.take() {
            if worker.join().is_err() {
                tracing::error!("record logger worker panicked");
            }
            tracing::debug!(dropped = self.dropped(), "record logger drained");
        }
    }

    fn record_drop(&self, id: u64, reason: &'static str) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(id, reason, dropped, "dropped record");
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.close();
    }
}

impl RecordLogger for Logger {
    fn log_record(&self, record: Record) {
        let _ = self.log(record);
    }
}

fn drain(mut receiver: mpsc::Receiver<Record>, sink: &dyn RecordSink) {
    while let Some(record) = receiver.blocking_recv() {
        if let Err(err) = sink.append(&record) {
            tracing::error!(id = record.id, "append record: {err}");
        }
    }
}
