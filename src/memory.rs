//! In-process log backend.
//!
//! `MemoryLog` implements [`LogClient`] and [`OffsetResolver`] over topics
//! held in memory. Partitions tail by default: readers wait for appends until
//! closed. A sealed partition ends its readers' message sequence once they
//! have read everything. Open and close failures and transport errors can be
//! injected per partition.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{oneshot, Notify};

use crate::offset::{OffsetMap, PartitionOffset, Position};
use crate::reader::{self, LogClient, Message, PartitionReader, ReaderCloser, ReaderFeed};
use crate::resolve::OffsetResolver;
use crate::{Error, Result};

const DEFAULT_READ_AHEAD: usize = 64;
const FETCH_BATCH: usize = 256;

#[derive(Debug, Clone)]
struct Record {
    offset: i64,
    timestamp_ms: i64,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct PartitionLog {
    records: VecDeque<Record>,
    next_offset: i64,
    sealed: bool,
    errors: Vec<String>,
    fail_open: bool,
    fail_close: bool,
}

impl PartitionLog {
    fn earliest(&self) -> i64 {
        self.records.front().map_or(self.next_offset, |r| r.offset)
    }
}

#[derive(Debug, Default)]
struct MemoryPartition {
    log: Mutex<PartitionLog>,
    notify: Notify,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl MemoryPartition {
    fn lock(&self) -> MutexGuard<'_, PartitionLog> {
        match self.log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct MemoryLog {
    topics: Mutex<HashMap<String, Vec<Arc<MemoryPartition>>>>,
    read_ahead: usize,
    closed: Mutex<bool>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            read_ahead: DEFAULT_READ_AHEAD,
            closed: Mutex::new(false),
        }
    }

    /// Messages a reader may buffer ahead of its supervisor.
    pub fn with_read_ahead(mut self, read_ahead: usize) -> Self {
        self.read_ahead = read_ahead.max(1);
        self
    }

    /// Creates `topic` with partitions `0..partitions`. Existing topics are kept.
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut topics = lock(&self.topics);
        topics.entry(topic.to_string()).or_insert_with(|| {
            (0..partitions.max(0))
                .map(|_| Arc::new(MemoryPartition::default()))
                .collect()
        });
    }

    /// Appends with the current wall-clock timestamp. Returns the offset.
    pub fn append(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>) -> Result<i64> {
        self.append_at(topic, partition, now_ms(), payload)
    }

    pub fn append_at(
        &self,
        topic: &str,
        partition: i32,
        timestamp_ms: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Result<i64> {
        let part = self.partition(topic, partition)?;
        let offset = {
            let mut log = part.lock();
            if log.sealed {
                return Err(Error::Client(format!(
                    "partition {partition} of {topic} is sealed"
                )));
            }
            let offset = log.next_offset;
            log.records.push_back(Record {
                offset,
                timestamp_ms,
                payload: payload.into(),
            });
            log.next_offset += 1;
            offset
        };
        part.notify.notify_waiters();
        Ok(offset)
    }

    /// Drops records below `offset`, moving the earliest retained offset.
    pub fn truncate_before(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let part = self.partition(topic, partition)?;
        let mut log = part.lock();
        while log.records.front().is_some_and(|r| r.offset < offset) {
            log.records.pop_front();
        }
        if log.records.is_empty() && log.next_offset < offset {
            log.next_offset = offset;
        }
        Ok(())
    }

    /// Marks the partition fully written: readers end after the last record.
    pub fn seal(&self, topic: &str, partition: i32) -> Result<()> {
        let part = self.partition(topic, partition)?;
        part.lock().sealed = true;
        part.notify.notify_waiters();
        Ok(())
    }

    /// Publishes a transport error to every reader of the partition.
    pub fn inject_error(&self, topic: &str, partition: i32, reason: impl Into<String>) -> Result<()> {
        let part = self.partition(topic, partition)?;
        part.lock().errors.push(reason.into());
        part.notify.notify_waiters();
        Ok(())
    }

    pub fn fail_opens(&self, topic: &str, partition: i32) -> Result<()> {
        self.partition(topic, partition)?.lock().fail_open = true;
        Ok(())
    }

    pub fn fail_closes(&self, topic: &str, partition: i32) -> Result<()> {
        self.partition(topic, partition)?.lock().fail_close = true;
        Ok(())
    }

    pub fn open_count(&self, topic: &str, partition: i32) -> usize {
        self.partition(topic, partition)
            .map_or(0, |p| p.opens.load(Ordering::SeqCst))
    }

    pub fn close_count(&self, topic: &str, partition: i32) -> usize {
        self.partition(topic, partition)
            .map_or(0, |p| p.closes.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }

    fn partition(&self, topic: &str, partition: i32) -> Result<Arc<MemoryPartition>> {
        let topics = lock(&self.topics);
        let partitions = topics
            .get(topic)
            .ok_or_else(|| Error::UnknownTopic(topic.to_string()))?;
        usize::try_from(partition)
            .ok()
            .and_then(|index| partitions.get(index))
            .cloned()
            .ok_or_else(|| Error::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })
    }

    fn partitions_of(&self, topic: &str) -> Result<Vec<Arc<MemoryPartition>>> {
        lock(&self.topics)
            .get(topic)
            .cloned()
            .ok_or_else(|| Error::UnknownTopic(topic.to_string()))
    }
}

impl LogClient for MemoryLog {
    fn open(&self, topic: &str, partition: i32, offset: i64) -> Result<PartitionReader> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let part = self.partition(topic, partition)?;
        let fail_close = {
            let log = part.lock();
            if log.fail_open {
                return Err(Error::Open {
                    partition,
                    reason: "injected open failure".into(),
                });
            }
            log.fail_close
        };
        part.opens.fetch_add(1, Ordering::SeqCst);

        let (feed, streams) = reader::feed(partition, self.read_ahead);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(fetch(Arc::clone(&part), feed, offset, stop_rx));

        let closer = MemoryCloser {
            partition,
            stop: stop_tx,
            part,
            fail: fail_close,
        };
        Ok(PartitionReader::new(
            topic,
            partition,
            offset,
            streams,
            Box::new(closer),
        ))
    }

    fn close(&self) -> Result<()> {
        let mut closed = lock(&self.closed);
        if *closed {
            return Err(Error::Closed);
        }
        *closed = true;
        Ok(())
    }
}

impl OffsetResolver for MemoryLog {
    fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let count = self.partitions_of(topic)?.len();
        Ok((0..count as i32).collect())
    }

    fn resolve(&self, topic: &str, position: Position) -> Result<OffsetMap> {
        let partitions = self.partitions_of(topic)?;
        Ok(partitions
            .iter()
            .enumerate()
            .map(|(index, part)| {
                let log = part.lock();
                let offset = match position {
                    Position::Earliest => log.earliest(),
                    Position::Latest => log.next_offset,
                    Position::Timestamp(ms) => log
                        .records
                        .iter()
                        .find(|r| r.timestamp_ms >= ms)
                        .map_or(log.next_offset, |r| r.offset),
                };
                let partition = index as i32;
                (partition, PartitionOffset::new(topic, partition, offset))
            })
            .collect())
    }
}

struct MemoryCloser {
    partition: i32,
    stop: oneshot::Sender<()>,
    part: Arc<MemoryPartition>,
    fail: bool,
}

impl ReaderCloser for MemoryCloser {
    fn close(self: Box<Self>) -> Result<()> {
        let _ = self.stop.send(());
        self.part.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Close {
                partition: self.partition,
                reason: "injected close failure".into(),
            });
        }
        Ok(())
    }
}

/// Feeds one reader until it is closed or, on a sealed partition, exhausted.
async fn fetch(
    part: Arc<MemoryPartition>,
    feed: ReaderFeed,
    mut offset: i64,
    mut stop: oneshot::Receiver<()>,
) {
    let mut error_cursor = 0;

    loop {
        // Registered before inspecting the log so an append in between is not missed.
        let appended = part.notify.notified();

        let (batch, errors, sealed) = {
            let log = part.lock();
            offset = offset.max(log.earliest());
            let batch: Vec<Record> = log
                .records
                .iter()
                .skip_while(|r| r.offset < offset)
                .take(FETCH_BATCH)
                .cloned()
                .collect();
            let errors = log.errors[error_cursor.min(log.errors.len())..].to_vec();
            error_cursor = log.errors.len();
            (batch, errors, log.sealed)
        };

        for reason in errors {
            feed.report(reason);
        }

        if batch.is_empty() {
            if sealed {
                return;
            }
            tokio::select! {
                _ = &mut stop => return,
                _ = feed.closed() => return,
                _ = appended => continue,
            }
        }

        for record in batch {
            let message = Message::new(feed.partition(), record.offset, record.payload);
            tokio::select! {
                biased;
                _ = &mut stop => return,
                delivered = feed.deliver(message) => {
                    if delivered.is_err() {
                        return;
                    }
                }
            }
            offset = record.offset + 1;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
