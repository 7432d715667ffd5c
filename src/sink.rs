use std::io::Write;

use crate::reader::Message;
use crate::Result;

/// Sink trait for rendered payloads.
pub trait Sink: Send {
    /// Write a message to the sink.
    fn write(&mut self, msg: &Message) -> Result<()>;

    /// Flush any buffered data.
    fn flush(&mut self) -> Result<()>;
}

/// Writes each raw payload followed by a newline.
pub struct LineSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> LineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Sink for LineSink<W> {
    fn write(&mut self, msg: &Message) -> Result<()> {
        self.writer.write_all(&msg.payload)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Sink that drops all messages (for benchmarking).
pub struct NullSink;

impl Sink for NullSink {
    fn write(&mut self, _msg: &Message) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sink that collects messages in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    messages: Vec<Message>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    /// Offsets seen for one partition, in arrival order.
    pub fn offsets(&self, partition: i32) -> Vec<i64> {
        self.messages
            .iter()
            .filter(|m| m.partition == partition)
            .map(|m| m.offset)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Sink for VecSink {
    fn write(&mut self, msg: &Message) -> Result<()> {
        self.messages.push(msg.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
