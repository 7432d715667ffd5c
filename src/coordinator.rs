//! Fan-in coordinator.
//!
//! ```text
//!  partition 0 ──► PartitionSupervisor ──┐
//!                                        │     ┌────────────┐
//!  partition 1 ──► PartitionSupervisor ──┼────►│ output     │──► Session::recv
//!                                        │     │ queue      │
//!  partition N ──► PartitionSupervisor ──┘     └────────────┘
//!                        ▲                           ▲
//!                   Shutdown signal          closed by the completion
//!                   (broadcast once)         watcher after join_all
//! ```
//!
//! Every reader is opened before any supervisor starts, so an open failure
//! under [`OpenFailurePolicy::Abort`] aborts the session before a single
//! message is forwarded. Supervisor handles are all registered before the
//! completion watcher is spawned; the watcher holds the last output sender
//! and drops it only after every supervisor has returned, which makes
//! "queue closed" imply "every reader released".

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::reader::{LogClient, Message, PartitionReader};
use crate::report::{Event, LogReporter, Reporter};
use crate::resolve::RangeMap;
use crate::shutdown::Shutdown;
use crate::supervisor::{PartitionSummary, PartitionSupervisor};
use crate::{Error, Result};

/// What to do when a partition reader cannot be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenFailurePolicy {
    /// Close every reader opened so far and fail the whole session.
    #[default]
    Abort,
    /// Report the failure and consume the remaining partitions.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeConfig {
    /// Output queue slots. Must be at least one; one is a direct handoff.
    pub queue_capacity: usize,
    pub open_failure: OpenFailurePolicy,
}

impl Default for ConsumeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1,
            open_failure: OpenFailurePolicy::Abort,
        }
    }
}

impl ConsumeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Per-partition outcomes, available once the output queue has closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub partitions: Vec<PartitionSummary>,
    /// Partitions that failed to open under [`OpenFailurePolicy::Skip`].
    pub skipped: Vec<i32>,
    pub panicked: usize,
}

impl SessionSummary {
    pub fn forwarded(&self) -> u64 {
        self.partitions.iter().map(|p| p.forwarded).sum()
    }

    pub fn partition(&self, id: i32) -> Option<&PartitionSummary> {
        self.partitions.iter().find(|p| p.partition == id)
    }

    pub fn close_failures(&self) -> usize {
        self.partitions.iter().filter(|p| p.close_failed()).count()
    }
}

/// A running consumption session.
pub struct Session {
    messages: mpsc::Receiver<Message>,
    shutdown: Shutdown,
    completion: JoinHandle<SessionSummary>,
    partitions: Vec<i32>,
}

impl Session {
    /// Next merged message; `None` once every supervisor has finished.
    pub async fn recv(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    /// Trigger for early termination of every partition.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Partitions with a running supervisor.
    pub fn partitions(&self) -> &[i32] {
        &self.partitions
    }

    /// Stops whatever is still running and returns every supervisor's outcome.
    ///
    /// Fires the shutdown signal and drops the output queue; after a queue
    /// that was already observed closed, this only collects the summary.
    pub async fn finish(self) -> Result<SessionSummary> {
        self.shutdown.trigger();
        drop(self.messages);
        self.completion
            .await
            .map_err(|err| Error::Task(format!("completion watcher: {err}")))
    }
}

pub struct FanInCoordinator {
    client: Arc<dyn LogClient>,
    config: ConsumeConfig,
    reporter: Arc<dyn Reporter>,
}

impl FanInCoordinator {
    pub fn new(client: Arc<dyn LogClient>) -> Self {
        Self {
            client,
            config: ConsumeConfig::default(),
            reporter: Arc::new(LogReporter),
        }
    }

    pub fn with_config(mut self, config: ConsumeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &ConsumeConfig {
        &self.config
    }

    /// Opens a reader per partition and starts one supervisor for each.
    ///
    /// Must be called from within a tokio runtime.
    pub fn consume(&self, topic: &str, ranges: &RangeMap) -> Result<Session> {
        self.config.validate()?;

        let mut opened: Vec<(PartitionReader, Option<i64>)> = Vec::with_capacity(ranges.len());
        let mut skipped = Vec::new();
        let mut last_error = None;

        for (&partition, range) in ranges {
            self.reporter.report(Event::Consuming {
                topic: topic.to_string(),
                partition,
                start: range.start,
                end: range.end,
            });
            match self.client.open(topic, partition, range.start) {
                Ok(reader) => opened.push((reader, range.end)),
                Err(err) => {
                    self.reporter.report(Event::OpenFailed {
                        partition,
                        reason: err.to_string(),
                    });
                    match self.config.open_failure {
                        OpenFailurePolicy::Abort => {
                            self.release(opened);
                            return Err(err);
                        }
                        OpenFailurePolicy::Skip => {
                            skipped.push(partition);
                            last_error = Some(err);
                        }
                    }
                }
            }
        }

        if opened.is_empty() {
            if let Some(err) = last_error {
                return Err(err);
            }
        }

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let shutdown = Shutdown::new();
        let partitions: Vec<i32> = opened.iter().map(|(reader, _)| reader.partition()).collect();

        let handles: Vec<JoinHandle<PartitionSummary>> = opened
            .into_iter()
            .map(|(reader, end)| {
                let supervisor = PartitionSupervisor::new(
                    reader,
                    end,
                    shutdown.listener(),
                    tx.clone(),
                    Arc::clone(&self.reporter),
                );
                tokio::spawn(supervisor.run())
            })
            .collect();

        let completion = tokio::spawn(watch_completion(
            handles,
            tx,
            skipped,
            Arc::clone(&self.reporter),
        ));

        Ok(Session {
            messages: rx,
            shutdown,
            completion,
            partitions,
        })
    }

    /// Same as [`consume`](Self::consume), but opens the readers on tokio's
    /// blocking pool. Backends whose `open` does network round trips then
    /// leave the runtime workers free.
    pub async fn start(self, topic: impl Into<String>, ranges: RangeMap) -> Result<Session> {
        let topic = topic.into();
        tokio::task::spawn_blocking(move || self.consume(&topic, &ranges))
            .await
            .map_err(|err| Error::Task(format!("reader startup: {err}")))?
    }

    fn release(&self, opened: Vec<(PartitionReader, Option<i64>)>) {
        for (reader, _) in opened {
            let partition = reader.partition();
            if let Err(err) = reader.close() {
                self.reporter.report(Event::CloseFailed {
                    partition,
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// Convenience wrapper over [`FanInCoordinator`] with default config.
pub fn consume_partitions(
    client: Arc<dyn LogClient>,
    topic: &str,
    ranges: &RangeMap,
) -> Result<Session> {
    FanInCoordinator::new(client).consume(topic, ranges)
}

async fn watch_completion(
    handles: Vec<JoinHandle<PartitionSummary>>,
    output: mpsc::Sender<Message>,
    skipped: Vec<i32>,
    reporter: Arc<dyn Reporter>,
) -> SessionSummary {
    let mut summary = SessionSummary {
        skipped,
        ..SessionSummary::default()
    };

    for joined in join_all(handles).await {
        match joined {
            Ok(partition) => {
                reporter.report(Event::PartitionFinished(partition.clone()));
                summary.partitions.push(partition);
            }
            Err(err) => {
                summary.panicked += 1;
                reporter.report(Event::SupervisorPanicked {
                    reason: err.to_string(),
                });
            }
        }
    }

    reporter.report(Event::QueueClosed {
        partitions: summary.partitions.len(),
        forwarded: summary.forwarded(),
    });
    // Last sender: dropping it closes the output queue.
    drop(output);
    summary
}
