//! Partition readers and the log client that opens them.
//!
//! A [`PartitionReader`] is the consuming half of two channels fed by a
//! backend task: the message sequence and the advisory transport error
//! sequence. Backends keep the producing half, a [`ReaderFeed`], and stop
//! when their [`ReaderCloser`] fires or the feed reports the reader gone.

use std::fmt;

use tokio::sync::mpsc;

use crate::{Error, Result};

/// One record read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(partition: i32, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            payload: payload.into(),
        }
    }
}

/// Transport error observed while reading. Advisory: it does not end the
/// message sequence by itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadError {
    pub partition: i32,
    pub reason: String,
}

impl ReadError {
    pub fn new(partition: i32, reason: impl Into<String>) -> Self {
        Self {
            partition,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition {}: {}", self.partition, self.reason)
    }
}

impl std::error::Error for ReadError {}

/// Releases the backend resources behind a reader.
pub trait ReaderCloser: Send {
    fn close(self: Box<Self>) -> Result<()>;
}

/// Producing half of a reader, held by the backend fetch task.
pub struct ReaderFeed {
    partition: i32,
    messages: mpsc::Sender<Message>,
    errors: mpsc::UnboundedSender<ReadError>,
}

/// Consuming half of a reader, before a closer is attached.
pub struct ReaderStreams {
    messages: mpsc::Receiver<Message>,
    errors: mpsc::UnboundedReceiver<ReadError>,
}

/// Creates a connected feed/streams pair. `buffer` bounds read-ahead.
pub fn feed(partition: i32, buffer: usize) -> (ReaderFeed, ReaderStreams) {
    let (message_tx, message_rx) = mpsc::channel(buffer.max(1));
    let (error_tx, error_rx) = mpsc::unbounded_channel();
    (
        ReaderFeed {
            partition,
            messages: message_tx,
            errors: error_tx,
        },
        ReaderStreams {
            messages: message_rx,
            errors: error_rx,
        },
    )
}

impl ReaderFeed {
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Hands one message to the reader. Fails with [`Error::Closed`] once the
    /// reader has been closed.
    pub async fn deliver(&self, message: Message) -> Result<()> {
        self.messages.send(message).await.map_err(|_| Error::Closed)
    }

    /// Publishes a transport error. Dropped silently when nobody watches.
    pub fn report(&self, reason: impl Into<String>) {
        let _ = self.errors.send(ReadError::new(self.partition, reason));
    }

    /// Resolves when the reader side has gone away.
    pub async fn closed(&self) {
        self.messages.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.messages.is_closed()
    }
}

/// Lazy reader over one partition, positioned at its start offset.
pub struct PartitionReader {
    topic: String,
    partition: i32,
    start_offset: i64,
    messages: mpsc::Receiver<Message>,
    errors: Option<mpsc::UnboundedReceiver<ReadError>>,
    closer: Box<dyn ReaderCloser>,
}

impl PartitionReader {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        start_offset: i64,
        streams: ReaderStreams,
        closer: Box<dyn ReaderCloser>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            start_offset,
            messages: streams.messages,
            errors: Some(streams.errors),
            closer,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Offset the reader was opened at.
    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    /// Next message in offset order, or `None` when the partition is
    /// exhausted. Cancel safe.
    pub async fn next(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    /// Takes the transport error sequence. Returns `None` on the second call.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<ReadError>> {
        self.errors.take()
    }

    /// Closes the reader. Consuming `self` makes a second close unrepresentable.
    pub fn close(self) -> Result<()> {
        let Self {
            mut messages,
            closer,
            ..
        } = self;
        messages.close();
        closer.close()
    }
}

impl fmt::Debug for PartitionReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionReader")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("start_offset", &self.start_offset)
            .finish_non_exhaustive()
    }
}

/// Connected client able to open partition readers.
///
/// `open` is called from inside a tokio runtime; backends may spawn their
/// fetch tasks there.
pub trait LogClient: Send + Sync {
    fn open(&self, topic: &str, partition: i32, offset: i64) -> Result<PartitionReader>;

    /// Releases the client itself. Called by the owner once every session
    /// using it has closed its output queue.
    fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingCloser(Arc<AtomicUsize>);

    impl ReaderCloser for CountingCloser {
        fn close(self: Box<Self>) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_in_order_then_ends_when_feed_drops() {
        let closes = Arc::new(AtomicUsize::new(0));
        let (feed, streams) = feed(3, 4);
        let mut reader =
            PartitionReader::new("t", 3, 0, streams, Box::new(CountingCloser(closes.clone())));

        feed.deliver(Message::new(3, 0, "a")).await.unwrap();
        feed.deliver(Message::new(3, 1, "b")).await.unwrap();
        drop(feed);

        assert_eq!(reader.next().await.unwrap().offset, 0);
        assert_eq!(reader.next().await.unwrap().offset, 1);
        assert!(reader.next().await.is_none());

        reader.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deliver_after_close_fails_closed() {
        let closes = Arc::new(AtomicUsize::new(0));
        let (feed, streams) = feed(0, 1);
        let reader = PartitionReader::new("t", 0, 0, streams, Box::new(CountingCloser(closes)));
        reader.close().unwrap();

        assert!(feed.is_closed());
        let err = feed.deliver(Message::new(0, 0, "x")).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn errors_are_taken_once() {
        let (feed, streams) = feed(1, 1);
        let mut reader = PartitionReader::new(
            "t",
            1,
            0,
            streams,
            Box::new(CountingCloser(Arc::new(AtomicUsize::new(0)))),
        );
        feed.report("broker went away");
        let mut errors = reader.take_errors().unwrap();
        assert!(reader.take_errors().is_none());
        assert_eq!(errors.recv().await.unwrap().reason, "broker went away");
    }
}
