//! Kafka backend over rdkafka.
//!
//! Every partition reader owns a dedicated `StreamConsumer` assigned to that
//! single partition, so closing one reader never disturbs the others. No
//! consumer group offsets are committed.
//!
//! Metadata lookups, `open` and `close` are blocking librdkafka calls that
//! may each take up to the client timeout. Call them from a blocking context
//! (`spawn_blocking`, or [`crate::FanInCoordinator::start`] for opens).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::Message as _;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::sync::oneshot;

use crate::offset::{OffsetMap, PartitionOffset, Position};
use crate::reader::{self, LogClient, Message, PartitionReader, ReaderCloser, ReaderFeed};
use crate::resolve::OffsetResolver;
use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_AHEAD: usize = 256;
const GROUP_ID: &str = "kt";

pub struct KafkaLog {
    config: ClientConfig,
    /// `None` once the client is closed.
    metadata: Mutex<Option<BaseConsumer>>,
    timeout: Duration,
}

impl KafkaLog {
    pub fn connect(brokers: &[String]) -> Result<Self> {
        if brokers.is_empty() {
            return Err(Error::Config("at least one broker is required".into()));
        }
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", GROUP_ID)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");
        let metadata: BaseConsumer = config.create().map_err(client_error)?;
        Ok(Self {
            config,
            metadata: Mutex::new(Some(metadata)),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn metadata(&self) -> MutexGuard<'_, Option<BaseConsumer>> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_metadata<T>(&self, call: impl FnOnce(&BaseConsumer) -> KafkaResult<T>) -> Result<T> {
        let metadata = self.metadata();
        let consumer = metadata.as_ref().ok_or(Error::Closed)?;
        call(consumer).map_err(client_error)
    }

    fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        self.with_metadata(|consumer| consumer.fetch_watermarks(topic, partition, self.timeout))
    }

    fn offsets_for_time(&self, topic: &str, partitions: &[i32], ms: i64) -> Result<OffsetMap> {
        let mut tpl = TopicPartitionList::new();
        for &partition in partitions {
            tpl.add_partition_offset(topic, partition, Offset::Offset(ms))
                .map_err(client_error)?;
        }
        let found =
            self.with_metadata(|consumer| consumer.offsets_for_times(tpl, self.timeout))?;

        let mut offsets = OffsetMap::new();
        for elem in found.elements() {
            let partition = elem.partition();
            let offset = match elem.offset() {
                Offset::Offset(offset) => offset,
                // No message at or after the timestamp: use the head.
                _ => self.watermarks(topic, partition)?.1,
            };
            offsets.insert(partition, PartitionOffset::new(topic, partition, offset));
        }
        Ok(offsets)
    }
}

impl LogClient for KafkaLog {
    fn open(&self, topic: &str, partition: i32, offset: i64) -> Result<PartitionReader> {
        if self.metadata().is_none() {
            return Err(Error::Closed);
        }
        let open_error = |err: KafkaError| Error::Open {
            partition,
            reason: err.to_string(),
        };
        let consumer: Arc<StreamConsumer> =
            Arc::new(self.config.create().map_err(open_error)?);
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset))
            .map_err(open_error)?;
        consumer.assign(&tpl).map_err(open_error)?;

        let (feed, streams) = reader::feed(partition, READ_AHEAD);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(fetch(Arc::clone(&consumer), feed, stop_rx));

        let closer = KafkaCloser {
            partition,
            consumer,
            stop: stop_tx,
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
        let metadata = self.metadata().take().ok_or(Error::Closed)?;
        drop(metadata);
        Ok(())
    }
}

impl OffsetResolver for KafkaLog {
    fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let metadata =
            self.with_metadata(|consumer| consumer.fetch_metadata(Some(topic), self.timeout))?;
        let found = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| Error::UnknownTopic(topic.to_string()))?;
        if found.error().is_some() || found.partitions().is_empty() {
            return Err(Error::UnknownTopic(topic.to_string()));
        }
        let mut ids: Vec<i32> = found.partitions().iter().map(|p| p.id()).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn resolve(&self, topic: &str, position: Position) -> Result<OffsetMap> {
        let partitions = self.partitions(topic)?;
        match position {
            Position::Timestamp(ms) => self.offsets_for_time(topic, &partitions, ms),
            Position::Earliest | Position::Latest => {
                let mut offsets = OffsetMap::new();
                for partition in partitions {
                    let (low, high) = self.watermarks(topic, partition)?;
                    let offset = if position == Position::Earliest { low } else { high };
                    offsets.insert(partition, PartitionOffset::new(topic, partition, offset));
                }
                Ok(offsets)
            }
        }
    }
}

struct KafkaCloser {
    partition: i32,
    consumer: Arc<StreamConsumer>,
    stop: oneshot::Sender<()>,
}

impl ReaderCloser for KafkaCloser {
    /// Unassigns the partition before returning, so no fetch is in flight
    /// once the reader reports closed. The fetch task drops its handle on stop.
    fn close(self: Box<Self>) -> Result<()> {
        let Self {
            partition,
            consumer,
            stop,
        } = *self;
        // A send error means the fetch task already exited.
        let _ = stop.send(());
        consumer.unassign().map_err(|err| Error::Close {
            partition,
            reason: err.to_string(),
        })
    }
}

async fn fetch(consumer: Arc<StreamConsumer>, feed: ReaderFeed, mut stop: oneshot::Receiver<()>) {
    loop {
        let message = tokio::select! {
            biased;
            _ = &mut stop => return,
            received = consumer.recv() => match received {
                Ok(msg) => Message::new(
                    msg.partition(),
                    msg.offset(),
                    msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                ),
                Err(err) => {
                    feed.report(err.to_string());
                    continue;
                }
            },
        };
        tokio::select! {
            biased;
            _ = &mut stop => return,
            delivered = feed.deliver(message) => {
                if delivered.is_err() {
                    return;
                }
            }
        }
    }
}

fn client_error(err: KafkaError) -> Error {
    Error::Client(err.to_string())
}
