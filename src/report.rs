//! Injected reporting interface for session events.
//!
//! Supervisors and the coordinator never write to a global logger; they hand
//! [`Event`]s to a [`Reporter`]. [`LogReporter`] forwards to the `log` facade,
//! [`Recorder`] keeps them for inspection.

use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};

use crate::reader::ReadError;
use crate::supervisor::PartitionSummary;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Consuming {
        topic: String,
        partition: i32,
        start: i64,
        end: Option<i64>,
    },
    OpenFailed {
        partition: i32,
        reason: String,
    },
    Transport(ReadError),
    ReachedEnd {
        partition: i32,
        offset: i64,
    },
    CloseFailed {
        partition: i32,
        reason: String,
    },
    SupervisorPanicked {
        reason: String,
    },
    PartitionFinished(PartitionSummary),
    QueueClosed {
        partitions: usize,
        forwarded: u64,
    },
    MaxReached {
        count: u64,
    },
}

pub trait Reporter: Send + Sync {
    fn report(&self, event: Event);
}

impl<R: Reporter + ?Sized> Reporter for Arc<R> {
    fn report(&self, event: Event) {
        (**self).report(event)
    }
}

/// Reports through `log`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, event: Event) {
        match event {
            Event::Consuming {
                topic,
                partition,
                start,
                end,
            } => match end {
                Some(end) => info!(
                    "Consuming {topic} partition {partition} starting at {start} (until {end})"
                ),
                None => info!("Consuming {topic} partition {partition} starting at {start}"),
            },
            Event::OpenFailed { partition, reason } => {
                error!("Failed to start consumer for partition {partition}: {reason}")
            }
            Event::Transport(err) => {
                warn!("error while consuming {err}")
            }
            Event::ReachedEnd { partition, offset } => {
                info!("Partition {partition} reached end offset at {offset}")
            }
            Event::CloseFailed { partition, reason } => {
                error!("Failed to close consumer for partition {partition}: {reason}")
            }
            Event::SupervisorPanicked { reason } => error!("Partition supervisor panicked: {reason}"),
            Event::PartitionFinished(summary) => debug!(
                "Partition {} finished ({:?}) after {} messages",
                summary.partition, summary.exit, summary.forwarded
            ),
            Event::QueueClosed {
                partitions,
                forwarded,
            } => info!("All {partitions} partitions finished, {forwarded} messages forwarded"),
            Event::MaxReached { count } => info!("Quitting after {count} messages"),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn transport_errors(&self) -> Vec<ReadError> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Transport(err) => Some(err),
                _ => None,
            })
            .collect()
    }
}

impl Reporter for Recorder {
    fn report(&self, event: Event) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
