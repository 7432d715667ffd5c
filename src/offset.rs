//! Offsets, per-partition ranges and the start/end position syntax.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::{Error, Result};

/// Symbolic position handed to an [`crate::resolve::OffsetResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Earliest offset still retained by the partition.
    Earliest,
    /// Next offset to be written (the log head).
    Latest,
    /// First offset whose timestamp is at or after the given epoch milliseconds.
    Timestamp(i64),
}

/// Where consumption starts on every partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
    /// Absolute offset, used as-is on every partition.
    Absolute(i64),
    /// `n` messages before the head, clamped at the earliest retained offset.
    Relative(i64),
    Timestamp(i64),
}

impl Default for StartPosition {
    fn default() -> Self {
        StartPosition::Latest
    }
}

impl StartPosition {
    pub fn from_rfc3339(value: &str) -> Result<Self> {
        parse_timestamp_ms(value).map(StartPosition::Timestamp)
    }
}

impl FromStr for StartPosition {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        match value {
            "beginning" | "oldest" | "earliest" => return Ok(StartPosition::Earliest),
            "end" | "newest" | "latest" => return Ok(StartPosition::Latest),
            _ => {}
        }
        if let Some(relative) = value.strip_prefix('-') {
            let back = relative
                .parse::<i64>()
                .map_err(|err| Error::Config(format!("invalid relative offset {value:?}: {err}")))?;
            return Ok(StartPosition::Relative(back));
        }
        let absolute = value
            .parse::<i64>()
            .map_err(|err| Error::Config(format!("invalid offset {value:?}: {err}")))?;
        Ok(StartPosition::Absolute(absolute))
    }
}

/// Where consumption stops on every partition (exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndPosition {
    Timestamp(i64),
    /// Head of each partition at session start.
    Head,
}

impl EndPosition {
    pub fn from_rfc3339(value: &str) -> Result<Self> {
        parse_timestamp_ms(value).map(EndPosition::Timestamp)
    }

    pub fn position(self) -> Position {
        match self {
            EndPosition::Timestamp(ms) => Position::Timestamp(ms),
            EndPosition::Head => Position::Latest,
        }
    }
}

/// Resolved offset for one partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl PartitionOffset {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for PartitionOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// Resolver output keyed by partition id.
pub type OffsetMap = BTreeMap<i32, PartitionOffset>;

/// Start offset and optional exclusive end offset of one partition.
///
/// `end < start` is accepted: the first message read is then already past
/// the end and the partition closes without forwarding anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRange {
    pub start: i64,
    pub end: Option<i64>,
}

impl PartitionRange {
    pub fn new(start: i64, end: Option<i64>) -> Self {
        Self { start, end }
    }

    pub fn unbounded(start: i64) -> Self {
        Self { start, end: None }
    }

    /// True when `offset` falls at or past the end of the range.
    pub fn is_past_end(&self, offset: i64) -> bool {
        matches!(self.end, Some(end) if offset >= end)
    }
}

/// Parses an RFC3339 timestamp into epoch milliseconds.
pub fn parse_timestamp_ms(value: &str) -> Result<i64> {
    let parsed = OffsetDateTime::parse(value.trim(), &Rfc3339).map_err(|err| {
        Error::Config(format!(
            "invalid time format {value:?} (RFC3339 required): {err}"
        ))
    })?;
    Ok((parsed.unix_timestamp_nanos() / 1_000_000) as i64)
}
