use std::sync::Arc;
use std::time::Duration;

use kt::sink::VecSink;
use kt::{
    drain, plan_ranges, ConsumeConfig, EndPosition, Error, Event, ExitReason, FanInCoordinator,
    LogClient, LogReporter, MemoryLog, OpenFailurePolicy, PartitionRange, RangeMap, Recorder,
    StartPosition,
};
use tokio::time::timeout;

const TOPIC: &str = "orders";

fn topic(partitions: i32) -> Arc<MemoryLog> {
    let log = Arc::new(MemoryLog::new());
    log.create_topic(TOPIC, partitions);
    log
}

fn fill(log: &MemoryLog, partition: i32, count: usize) {
    for i in 0..count {
        log.append(TOPIC, partition, format!("p{partition}-{i}"))
            .expect("append");
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_offset_partition_closes_while_tailing_partition_keeps_queue_open() {
    let log = topic(2);
    fill(&log, 0, 5);
    fill(&log, 1, 7);

    let mut ranges = RangeMap::new();
    ranges.insert(0, PartitionRange::new(0, Some(3)));
    ranges.insert(1, PartitionRange::unbounded(5));

    let recorder = Recorder::new();
    let mut session = FanInCoordinator::new(log.clone())
        .with_reporter(recorder.clone())
        .consume(TOPIC, &ranges)
        .expect("consume");

    let mut seen = Vec::new();
    for _ in 0..5 {
        let message = timeout(Duration::from_secs(2), session.recv())
            .await
            .expect("message in time")
            .expect("queue open");
        seen.push((message.partition, message.offset));
    }

    let offsets = |partition: i32| -> Vec<i64> {
        seen.iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, offset)| *offset)
            .collect()
    };
    assert_eq!(offsets(0), vec![0, 1, 2]);
    assert_eq!(offsets(1), vec![5, 6]);

    eventually(|| log.close_count(TOPIC, 0) == 1).await;
    assert!(
        timeout(Duration::from_millis(50), session.recv()).await.is_err(),
        "queue must stay open while partition 1 tails"
    );
    assert_eq!(log.close_count(TOPIC, 1), 0);

    session.shutdown().trigger();
    let closed = timeout(Duration::from_secs(2), session.recv())
        .await
        .expect("queue closes after shutdown");
    assert!(closed.is_none());
    assert_eq!(log.close_count(TOPIC, 1), 1);

    let summary = session.finish().await.expect("summary");
    assert_eq!(
        summary.partition(0).map(|p| p.exit),
        Some(ExitReason::ReachedEnd { offset: 3 })
    );
    assert_eq!(summary.partition(1).map(|p| p.exit), Some(ExitReason::Shutdown));
    assert_eq!(summary.forwarded(), 5);
    assert!(recorder
        .events()
        .iter()
        .any(|e| matches!(e, Event::QueueClosed { partitions: 2, forwarded: 5 })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn max_count_prints_exactly_one_and_releases_every_reader() {
    let log = topic(2);
    fill(&log, 0, 10);
    fill(&log, 1, 10);

    let ranges = plan_ranges(log.as_ref(), TOPIC, StartPosition::Earliest, None, None)
        .expect("plan");
    let mut session = FanInCoordinator::new(log.clone())
        .consume(TOPIC, &ranges)
        .expect("consume");

    let mut sink = VecSink::new();
    let stats = timeout(
        Duration::from_secs(2),
        drain(&mut session, Some(1), &mut sink, &LogReporter),
    )
    .await
    .expect("drain finishes")
    .expect("drain");

    assert_eq!(stats.rendered, 1);
    assert_eq!(sink.len(), 1);
    // Drain returns only once the queue has closed.
    assert_eq!(log.close_count(TOPIC, 0), 1);
    assert_eq!(log.close_count(TOPIC, 1), 1);

    let summary = session.finish().await.expect("summary");
    assert!(summary
        .partitions
        .iter()
        .all(|p| p.exit == ExitReason::Shutdown));
    log.close().expect("client close");
}

#[tokio::test]
async fn open_failure_aborts_before_anything_is_forwarded() {
    let log = topic(3);
    fill(&log, 0, 3);
    fill(&log, 1, 3);
    fill(&log, 2, 3);
    log.fail_opens(TOPIC, 1).expect("inject");

    let ranges = plan_ranges(log.as_ref(), TOPIC, StartPosition::Earliest, None, None)
        .expect("plan");
    let recorder = Recorder::new();
    let result = FanInCoordinator::new(log.clone())
        .with_reporter(recorder.clone())
        .consume(TOPIC, &ranges);

    let err = result.err().expect("open failure is fatal");
    assert!(matches!(err, Error::Open { partition: 1, .. }));
    assert!(err.is_startup());
    // Partition 0 was opened first and released; partition 2 never opened.
    assert_eq!(log.close_count(TOPIC, 0), 1);
    assert_eq!(log.open_count(TOPIC, 2), 0);
    assert!(recorder
        .events()
        .iter()
        .any(|e| matches!(e, Event::OpenFailed { partition: 1, .. })));
}

#[tokio::test]
async fn skip_policy_consumes_the_remaining_partitions() {
    let log = topic(3);
    for partition in 0..3 {
        fill(&log, partition, 2);
        log.seal(TOPIC, partition).expect("seal");
    }
    log.fail_opens(TOPIC, 1).expect("inject");

    let ranges = plan_ranges(log.as_ref(), TOPIC, StartPosition::Earliest, None, None)
        .expect("plan");
    let config = ConsumeConfig {
        open_failure: OpenFailurePolicy::Skip,
        ..ConsumeConfig::default()
    };
    let mut session = FanInCoordinator::new(log.clone())
        .with_config(config)
        .with_reporter(Recorder::new())
        .consume(TOPIC, &ranges)
        .expect("consume");
    assert_eq!(session.partitions(), &[0, 2]);

    let mut sink = VecSink::new();
    drain(&mut session, None, &mut sink, &LogReporter)
        .await
        .expect("drain");
    assert_eq!(sink.offsets(0), vec![0, 1]);
    assert_eq!(sink.offsets(2), vec![0, 1]);

    let summary = session.finish().await.expect("summary");
    assert_eq!(summary.skipped, vec![1]);
    assert_eq!(summary.partitions.len(), 2);
}

#[tokio::test]
async fn skip_policy_with_every_partition_failing_is_an_error() {
    let log = topic(1);
    log.fail_opens(TOPIC, 0).expect("inject");
    let ranges = plan_ranges(log.as_ref(), TOPIC, StartPosition::Latest, None, None)
        .expect("plan");
    let result = FanInCoordinator::new(log.clone())
        .with_config(ConsumeConfig {
            open_failure: OpenFailurePolicy::Skip,
            ..ConsumeConfig::default()
        })
        .with_reporter(Recorder::new())
        .consume(TOPIC, &ranges);
    assert!(matches!(result.err(), Some(Error::Open { partition: 0, .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_partitions_close_the_queue_and_keep_per_partition_order() {
    let log = topic(4);
    for partition in 0..4 {
        fill(&log, partition, 50);
        log.seal(TOPIC, partition).expect("seal");
    }

    let ranges = plan_ranges(log.as_ref(), TOPIC, StartPosition::Earliest, None, None)
        .expect("plan");
    let mut session = FanInCoordinator::new(log.clone())
        .with_config(ConsumeConfig {
            queue_capacity: 8,
            ..ConsumeConfig::default()
        })
        .with_reporter(Recorder::new())
        .consume(TOPIC, &ranges)
        .expect("consume");

    let mut sink = VecSink::new();
    let stats = drain(&mut session, None, &mut sink, &LogReporter)
        .await
        .expect("drain");
    assert_eq!(stats.rendered, 200);
    for partition in 0..4 {
        assert_eq!(sink.offsets(partition), (0..50).collect::<Vec<i64>>());
        assert_eq!(log.close_count(TOPIC, partition), 1);
    }

    let summary = session.finish().await.expect("summary");
    assert!(summary
        .partitions
        .iter()
        .all(|p| p.exit == ExitReason::Exhausted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exit_at_head_finishes_without_new_messages() {
    let log = topic(3);
    fill(&log, 0, 4);
    fill(&log, 1, 2);
    // Partition 2 is empty: start == end == 0.

    let ranges = plan_ranges(
        log.as_ref(),
        TOPIC,
        StartPosition::Earliest,
        Some(EndPosition::Head),
        None,
    )
    .expect("plan");
    assert_eq!(ranges[&0], PartitionRange::new(0, Some(4)));
    assert_eq!(ranges[&2], PartitionRange::new(0, Some(0)));

    let mut session = FanInCoordinator::new(log.clone())
        .with_reporter(Recorder::new())
        .consume(TOPIC, &ranges)
        .expect("consume");

    // Written after the head was resolved: never forwarded.
    fill(&log, 1, 3);

    let mut sink = VecSink::new();
    timeout(
        Duration::from_secs(2),
        drain(&mut session, None, &mut sink, &LogReporter),
    )
    .await
    .expect("session ends on its own")
    .expect("drain");

    assert_eq!(sink.offsets(0), vec![0, 1, 2, 3]);
    assert_eq!(sink.offsets(1), vec![0, 1]);
    assert!(sink.offsets(2).is_empty());

    let summary = session.finish().await.expect("summary");
    assert_eq!(
        summary.partition(2).map(|p| p.exit),
        Some(ExitReason::ReachedEnd { offset: 0 })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timestamp_window_selects_messages() {
    let log = topic(1);
    for (ts, payload) in [(100, "a"), (200, "b"), (300, "c"), (400, "d"), (500, "e")] {
        log.append_at(TOPIC, 0, ts, payload).expect("append");
    }

    let ranges = plan_ranges(
        log.as_ref(),
        TOPIC,
        StartPosition::Timestamp(200),
        Some(EndPosition::Timestamp(400)),
        Some(0),
    )
    .expect("plan");
    let mut session = FanInCoordinator::new(log.clone())
        .with_reporter(Recorder::new())
        .consume(TOPIC, &ranges)
        .expect("consume");

    let mut sink = VecSink::new();
    timeout(
        Duration::from_secs(2),
        drain(&mut session, None, &mut sink, &LogReporter),
    )
    .await
    .expect("window closes")
    .expect("drain");

    let payloads: Vec<_> = sink.messages().iter().map(|m| m.payload.clone()).collect();
    assert_eq!(payloads, vec![b"b".to_vec(), b"c".to_vec()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transport_errors_do_not_stop_the_session() {
    let log = topic(2);
    let recorder = Recorder::new();
    let ranges = plan_ranges(log.as_ref(), TOPIC, StartPosition::Latest, None, None)
        .expect("plan");
    let mut session = FanInCoordinator::new(log.clone())
        .with_reporter(recorder.clone())
        .consume(TOPIC, &ranges)
        .expect("consume");

    log.inject_error(TOPIC, 0, "not leader for partition").expect("inject");
    eventually(|| !recorder.transport_errors().is_empty()).await;

    fill(&log, 0, 2);
    fill(&log, 1, 1);
    let mut received = 0;
    while received < 3 {
        timeout(Duration::from_secs(2), session.recv())
            .await
            .expect("messages keep flowing")
            .expect("queue open");
        received += 1;
    }

    let errors = recorder.transport_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].partition, 0);

    let summary = session.finish().await.expect("summary");
    assert_eq!(summary.forwarded(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_releases_every_reader_exactly_once() {
    let log = topic(8);
    for partition in 0..8 {
        fill(&log, partition, 20);
    }

    let ranges = plan_ranges(log.as_ref(), TOPIC, StartPosition::Earliest, None, None)
        .expect("plan");
    let mut session = FanInCoordinator::new(log.clone())
        .with_reporter(Recorder::new())
        .consume(TOPIC, &ranges)
        .expect("consume");

    timeout(Duration::from_secs(2), session.recv())
        .await
        .expect("first message")
        .expect("queue open");

    assert!(session.shutdown().trigger());
    assert!(!session.shutdown().trigger());

    let mut drained = 0;
    loop {
        match timeout(Duration::from_secs(2), session.recv())
            .await
            .expect("supervisors stop in bounded time")
        {
            Some(_) => drained += 1,
            None => break,
        }
    }
    assert!(drained <= 8, "at most one queued message per slot and in flight");

    for partition in 0..8 {
        assert_eq!(log.open_count(TOPIC, partition), 1);
        assert_eq!(log.close_count(TOPIC, partition), 1);
    }
    let summary = session.finish().await.expect("summary");
    assert_eq!(summary.partitions.len(), 8);
}

#[tokio::test]
async fn close_failure_does_not_block_other_partitions() {
    let log = topic(2);
    for partition in 0..2 {
        fill(&log, partition, 3);
        log.seal(TOPIC, partition).expect("seal");
    }
    log.fail_closes(TOPIC, 0).expect("inject");

    let ranges = plan_ranges(log.as_ref(), TOPIC, StartPosition::Earliest, None, None)
        .expect("plan");
    let recorder = Recorder::new();
    let mut session = FanInCoordinator::new(log.clone())
        .with_reporter(recorder.clone())
        .consume(TOPIC, &ranges)
        .expect("consume");

    let mut sink = VecSink::new();
    drain(&mut session, None, &mut sink, &LogReporter)
        .await
        .expect("drain");
    assert_eq!(sink.len(), 6);

    let summary = session.finish().await.expect("summary");
    assert_eq!(summary.close_failures(), 1);
    assert!(recorder
        .events()
        .iter()
        .any(|e| matches!(e, Event::CloseFailed { partition: 0, .. })));
}

#[tokio::test]
async fn zero_capacity_queue_is_rejected() {
    let log = topic(1);
    let ranges = plan_ranges(log.as_ref(), TOPIC, StartPosition::Latest, None, None)
        .expect("plan");
    let result = FanInCoordinator::new(log.clone())
        .with_config(ConsumeConfig {
            queue_capacity: 0,
            ..ConsumeConfig::default()
        })
        .consume(TOPIC, &ranges);
    assert!(matches!(result.err(), Some(Error::Config(_))));
    assert_eq!(log.open_count(TOPIC, 0), 0);
}

#[tokio::test]
async fn empty_partition_set_closes_immediately() {
    let log = topic(1);
    let mut session = FanInCoordinator::new(log.clone())
        .with_reporter(Recorder::new())
        .consume(TOPIC, &RangeMap::new())
        .expect("consume");
    assert!(timeout(Duration::from_secs(1), session.recv())
        .await
        .expect("closes")
        .is_none());
    let summary = session.finish().await.expect("summary");
    assert!(summary.partitions.is_empty());
}

#[tokio::test]
async fn dropping_a_tailing_session_releases_every_reader() {
    let log = topic(2);
    let ranges = plan_ranges(log.as_ref(), TOPIC, StartPosition::Latest, None, None)
        .expect("plan");
    let session = FanInCoordinator::new(log.clone())
        .with_reporter(Recorder::new())
        .consume(TOPIC, &ranges)
        .expect("consume");
    assert_eq!(log.open_count(TOPIC, 0), 1);

    drop(session);

    eventually(|| log.close_count(TOPIC, 0) == 1 && log.close_count(TOPIC, 1) == 1).await;
}

#[tokio::test]
async fn start_opens_readers_off_the_runtime_worker() {
    let log = topic(2);
    for partition in 0..2 {
        fill(&log, partition, 3);
        log.seal(TOPIC, partition).expect("seal");
    }
    let ranges = plan_ranges(log.as_ref(), TOPIC, StartPosition::Earliest, None, None)
        .expect("plan");

    let mut session = FanInCoordinator::new(log.clone())
        .with_reporter(Recorder::new())
        .start(TOPIC, ranges)
        .await
        .expect("start");

    let mut sink = VecSink::new();
    drain(&mut session, None, &mut sink, &LogReporter)
        .await
        .expect("drain");
    assert_eq!(sink.offsets(0), vec![0, 1, 2]);
    assert_eq!(sink.offsets(1), vec![0, 1, 2]);
    assert_eq!(log.open_count(TOPIC, 1), 1);
}
