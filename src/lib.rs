//! Multi-partition log consumption with fan-in merge.
//!
//! One supervisor per partition pumps its reader into a shared bounded
//! queue; the coordinator closes that queue exactly once, after every
//! supervisor has released its reader.

pub mod consumer;
pub mod coordinator;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod offset;
pub mod reader;
pub mod report;
pub mod resolve;
pub mod shutdown;
pub mod sink;
pub mod supervisor;

pub use consumer::{drain, DrainStats};
pub use coordinator::{
    consume_partitions, ConsumeConfig, FanInCoordinator, OpenFailurePolicy, Session,
    SessionSummary,
};
pub use error::{Error, Result};
pub use memory::MemoryLog;
pub use offset::{EndPosition, PartitionOffset, PartitionRange, Position, StartPosition};
pub use reader::{LogClient, Message, PartitionReader, ReadError};
pub use report::{Event, LogReporter, Recorder, Reporter};
pub use resolve::{plan_ranges, OffsetResolver, RangeMap};
pub use shutdown::{Shutdown, ShutdownListener};
pub use supervisor::{ExitReason, PartitionSummary};
