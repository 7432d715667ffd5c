//! Partition supervisor: pumps one reader into the shared output queue.
//!
//! The supervisor races three termination triggers, first wins:
//!
//! - the reader's message sequence ends,
//! - the end offset is reached: a message at or past it arrives (and is
//!   not forwarded), the offset just before it was forwarded, or the reader
//!   already starts there,
//! - the shared shutdown signal fires,
//! - the output queue's receiver is dropped.
//!
//! Transport errors are observed in the same loop and reported without
//! stopping anything. Whatever the trigger, the reader is closed exactly once
//! before [`PartitionSupervisor::run`] returns.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::SendError, Permit};

use crate::offset::PartitionRange;
use crate::reader::{Message, PartitionReader, ReadError};
use crate::report::{Event, Reporter};
use crate::shutdown::ShutdownListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    Stopping,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The reader's message sequence ended.
    Exhausted,
    /// The end offset was reached; `offset` is the first offset not forwarded.
    ReachedEnd { offset: i64 },
    /// The shared shutdown signal fired.
    Shutdown,
    /// The output queue receiver was dropped.
    ConsumerGone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSummary {
    pub partition: i32,
    pub forwarded: u64,
    pub last_offset: Option<i64>,
    pub exit: ExitReason,
    /// `Closed` once the reader was released; `Stopping` when its close failed.
    pub state: SupervisorState,
}

impl PartitionSummary {
    pub fn close_failed(&self) -> bool {
        self.state != SupervisorState::Closed
    }
}

pub struct PartitionSupervisor {
    partition: i32,
    reader: Option<PartitionReader>,
    errors: Option<mpsc::UnboundedReceiver<ReadError>>,
    range: PartitionRange,
    shutdown: ShutdownListener,
    output: mpsc::Sender<Message>,
    reporter: Arc<dyn Reporter>,
    state: SupervisorState,
    forwarded: u64,
    last_offset: Option<i64>,
}

enum Step<'a> {
    Shutdown,
    ConsumerGone,
    Transport(Option<ReadError>),
    Forward(Result<Permit<'a, Message>, SendError<()>>),
    Read(Option<Message>),
}

impl PartitionSupervisor {
    pub fn new(
        mut reader: PartitionReader,
        end_offset: Option<i64>,
        shutdown: ShutdownListener,
        output: mpsc::Sender<Message>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let errors = reader.take_errors();
        Self {
            partition: reader.partition(),
            range: PartitionRange::new(reader.start_offset(), end_offset),
            reader: Some(reader),
            errors,
            shutdown,
            output,
            reporter,
            state: SupervisorState::Running,
            forwarded: 0,
            last_offset: None,
        }
    }

    pub async fn run(mut self) -> PartitionSummary {
        let exit = self.pump().await;
        self.state = SupervisorState::Stopping;
        self.drain_errors();
        self.close_reader();
        drop(self.output);
        PartitionSummary {
            partition: self.partition,
            forwarded: self.forwarded,
            last_offset: self.last_offset,
            exit,
            state: self.state,
        }
    }

    async fn pump(&mut self) -> ExitReason {
        let Some(reader) = self.reader.as_mut() else {
            return ExitReason::Exhausted;
        };
        if self.range.is_past_end(self.range.start) {
            return self.reached_end(self.range.start);
        }
        let mut pending: Option<Message> = None;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.shutdown.fired() => Step::Shutdown,
                _ = self.output.closed() => Step::ConsumerGone,
                err = next_error(&mut self.errors), if self.errors.is_some() => Step::Transport(err),
                permit = self.output.reserve(), if pending.is_some() => Step::Forward(permit),
                next = reader.next(), if pending.is_none() => Step::Read(next),
            };

            match step {
                Step::Shutdown => return ExitReason::Shutdown,
                Step::ConsumerGone => return ExitReason::ConsumerGone,
                Step::Transport(Some(err)) => self.reporter.report(Event::Transport(err)),
                Step::Transport(None) => self.errors = None,
                Step::Forward(Err(_)) => return ExitReason::ConsumerGone,
                Step::Forward(Ok(permit)) => {
                    let Some(message) = pending.take() else {
                        continue;
                    };
                    let next_offset = message.offset + 1;
                    self.last_offset = Some(message.offset);
                    self.forwarded += 1;
                    permit.send(message);
                    // The last offset before the end was forwarded: no need to wait for the next one.
                    if self.range.is_past_end(next_offset) {
                        return self.reached_end(next_offset);
                    }
                }
                Step::Read(None) => return ExitReason::Exhausted,
                Step::Read(Some(message)) => {
                    if self.range.is_past_end(message.offset) {
                        return self.reached_end(message.offset);
                    }
                    pending = Some(message);
                }
            }
        }
    }

    fn reached_end(&self, offset: i64) -> ExitReason {
        self.reporter.report(Event::ReachedEnd {
            partition: self.partition,
            offset,
        });
        ExitReason::ReachedEnd { offset }
    }

    fn drain_errors(&mut self) {
        let Some(errors) = self.errors.as_mut() else {
            return;
        };
        while let Ok(err) = errors.try_recv() {
            self.reporter.report(Event::Transport(err));
        }
        self.errors = None;
    }

    /// Leaves the state at `Stopping` when the backend reports a close failure.
    fn close_reader(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        match reader.close() {
            Ok(()) => self.state = SupervisorState::Closed,
            Err(err) => self.reporter.report(Event::CloseFailed {
                partition: self.partition,
                reason: err.to_string(),
            }),
        }
    }
}

async fn next_error(errors: &mut Option<mpsc::UnboundedReceiver<ReadError>>) -> Option<ReadError> {
    match errors {
        Some(errors) => errors.recv().await,
        None => std::future::pending().await,
    }
}
