use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("partition {partition} not found for topic {topic}")]
    UnknownPartition { topic: String, partition: i32 },
    #[error("failed to start consumer for partition {partition}: {reason}")]
    Open { partition: i32, reason: String },
    #[error("failed to close consumer for partition {partition}: {reason}")]
    Close { partition: i32, reason: String },
    #[error("resource already closed")]
    Closed,
    #[error("session task failed: {0}")]
    Task(String),
    #[error("log client error: {0}")]
    Client(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Configuration and open failures abort a session before any message is forwarded.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::UnknownTopic(_)
                | Error::UnknownPartition { .. }
                | Error::Open { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
