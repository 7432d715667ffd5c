use std::collections::BTreeMap;

use crate::offset::{EndPosition, OffsetMap, PartitionRange, Position, StartPosition};
use crate::{Error, Result};

/// Per-partition ranges handed to the coordinator.
pub type RangeMap = BTreeMap<i32, PartitionRange>;

/// Turns symbolic positions into absolute offsets for every partition of a topic.
pub trait OffsetResolver {
    /// Partition ids of `topic`, or [`Error::UnknownTopic`].
    fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    /// Absolute offset of `position` on every partition of `topic`.
    fn resolve(&self, topic: &str, position: Position) -> Result<OffsetMap>;
}

/// Builds the range map for a session.
///
/// All configuration errors surface here, before any reader is opened.
pub fn plan_ranges<R>(
    resolver: &R,
    topic: &str,
    start: StartPosition,
    end: Option<EndPosition>,
    only_partition: Option<i32>,
) -> Result<RangeMap>
where
    R: OffsetResolver + ?Sized,
{
    let mut starts = start_offsets(resolver, topic, start)?;

    if let Some(partition) = only_partition {
        let offset = starts.remove(&partition).ok_or_else(|| Error::UnknownPartition {
            topic: topic.to_string(),
            partition,
        })?;
        starts.clear();
        starts.insert(partition, offset);
    }

    let ends = match end {
        Some(end) => Some(resolver.resolve(topic, end.position())?),
        None => None,
    };

    Ok(starts
        .into_iter()
        .map(|(partition, start)| {
            let end = ends
                .as_ref()
                .and_then(|ends| ends.get(&partition))
                .map(|end| end.offset);
            (partition, PartitionRange::new(start, end))
        })
        .collect())
}

fn start_offsets<R>(resolver: &R, topic: &str, start: StartPosition) -> Result<BTreeMap<i32, i64>>
where
    R: OffsetResolver + ?Sized,
{
    let flatten = |map: OffsetMap| -> BTreeMap<i32, i64> {
        map.into_iter().map(|(partition, po)| (partition, po.offset)).collect()
    };

    match start {
        StartPosition::Earliest => Ok(flatten(resolver.resolve(topic, Position::Earliest)?)),
        StartPosition::Latest => Ok(flatten(resolver.resolve(topic, Position::Latest)?)),
        StartPosition::Timestamp(ms) => {
            Ok(flatten(resolver.resolve(topic, Position::Timestamp(ms))?))
        }
        StartPosition::Absolute(offset) => {
            if offset < 0 {
                return Err(Error::Config(format!("absolute offset {offset} is negative")));
            }
            Ok(resolver
                .partitions(topic)?
                .into_iter()
                .map(|partition| (partition, offset))
                .collect())
        }
        StartPosition::Relative(back) => {
            if back < 0 {
                return Err(Error::Config(format!("relative offset -{back} is invalid")));
            }
            let earliest = resolver.resolve(topic, Position::Earliest)?;
            let latest = resolver.resolve(topic, Position::Latest)?;
            Ok(latest
                .into_iter()
                .map(|(partition, head)| {
                    let floor = earliest.get(&partition).map_or(0, |po| po.offset);
                    (partition, head.offset.saturating_sub(back).max(floor))
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::PartitionOffset;

    struct FixedResolver;

    impl OffsetResolver for FixedResolver {
        fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
            if topic != "orders" {
                return Err(Error::UnknownTopic(topic.to_string()));
            }
            Ok(vec![0, 1])
        }

        fn resolve(&self, topic: &str, position: Position) -> Result<OffsetMap> {
            let offsets = match position {
                Position::Earliest => [2, 0],
                Position::Latest => [10, 4],
                Position::Timestamp(_) => [7, 3],
            };
            Ok(self
                .partitions(topic)?
                .into_iter()
                .map(|p| (p, PartitionOffset::new(topic, p, offsets[p as usize])))
                .collect())
        }
    }

    #[test]
    fn relative_offsets_clamp_at_earliest() {
        let ranges = plan_ranges(&FixedResolver, "orders", StartPosition::Relative(6), None, None)
            .unwrap();
        assert_eq!(ranges[&0], PartitionRange::unbounded(4));
        assert_eq!(ranges[&1], PartitionRange::unbounded(0));
    }

    #[test]
    fn end_position_fills_every_partition() {
        let ranges = plan_ranges(
            &FixedResolver,
            "orders",
            StartPosition::Earliest,
            Some(EndPosition::Head),
            None,
        )
        .unwrap();
        assert_eq!(ranges[&0], PartitionRange::new(2, Some(10)));
        assert_eq!(ranges[&1], PartitionRange::new(0, Some(4)));
    }

    #[test]
    fn single_partition_filter() {
        let ranges = plan_ranges(
            &FixedResolver,
            "orders",
            StartPosition::Timestamp(0),
            None,
            Some(1),
        )
        .unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[&1], PartitionRange::unbounded(3));
    }

    #[test]
    fn unknown_partition_is_a_config_error() {
        let err = plan_ranges(&FixedResolver, "orders", StartPosition::Latest, None, Some(9))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPartition { partition: 9, .. }));
        assert!(err.is_startup());
    }

    #[test]
    fn negative_absolute_offset_rejected() {
        let err = plan_ranges(&FixedResolver, "orders", StartPosition::Absolute(-1), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unknown_topic_propagates() {
        let err = plan_ranges(&FixedResolver, "nope", StartPosition::Latest, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTopic(_)));
    }
}
