//! Concurrency properties of the segmentation/extraction pipeline: event
//! ordering under adversarial completion order, slot-ring backpressure,
//! and the bounded-join budget.

mod helpers;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use framepipe::job::{DataOptions, StageSelect};
use framepipe::logging::LogFunnel;
use framepipe::model::LabelChunk;
use framepipe::runner::{join_stage, JobRunner};
use framepipe::slots::SlotRing;
use framepipe::store::Dataset;
use framepipe::FpError;
use serde_json::json;

fn chunk(frame_index: usize) -> LabelChunk {
    LabelChunk {
        frame_index,
        height: 1,
        width: 1,
        labels: vec![1],
        num_labels: 1,
    }
}

/// An extractor that stalls on even frames makes workers finish out of
/// order; the collector must still emit events in non-decreasing frame
/// order.
#[test]
fn events_stay_ordered_when_extraction_completes_out_of_order() {
    helpers::register_test_algorithms();
    let dir = tempfile::tempdir().expect("tempdir");
    let path_in = dir.path().join("raw.fpz");
    let path_out = dir.path().join("processed.fpz");
    helpers::write_flat_input(&path_in, 60);

    let mut job = helpers::test_job(path_in, path_out.clone());
    job.segmenter = StageSelect::new("whole-frame");
    job.extractor = StageSelect::with_kwargs("sleepy-echo", json!({"stall_ms": 10}));
    // Four workers -> two concurrent extractors under the CPU policy.
    job.num_workers = 4;

    JobRunner::new(job).expect("runner").run().expect("run");

    let data = Dataset::open(&path_out, &DataOptions::default()).expect("open");
    let indices = data.scalar("frame_index").expect("frame_index column");
    assert_eq!(indices.len(), 60);
    for pair in indices.windows(2) {
        assert!(
            pair[0] <= pair[1],
            "event order regressed: {} then {}",
            pair[0],
            pair[1]
        );
    }
}

/// With a single slot and a stalled consumer, the producer must block
/// rather than drop or overwrite: publish `n` only happens after release
/// of `n - 1`, and every chunk arrives exactly once.
#[test]
fn single_slot_backpressure_blocks_the_producer() {
    let ring = Arc::new(SlotRing::new(1));
    let (events_tx, events_rx) = mpsc::channel::<(&'static str, usize)>();

    let producer_ring = Arc::clone(&ring);
    let producer_events = events_tx.clone();
    let producer = std::thread::spawn(move || {
        for index in 0..5 {
            assert!(producer_ring.publish(chunk(index)));
            producer_events.send(("publish", index)).expect("record");
        }
    });

    let consumer_ring = Arc::clone(&ring);
    let consumer = std::thread::spawn(move || {
        let mut seen = Vec::new();
        while let Some((slot, taken)) = consumer_ring.claim() {
            // Stall with the chunk claimed, keeping the ring saturated.
            std::thread::sleep(Duration::from_millis(20));
            events_tx.send(("release", taken.frame_index)).expect("record");
            consumer_ring.release(slot);
            seen.push(taken.frame_index);
            if seen.len() == 5 {
                break;
            }
        }
        seen
    });

    producer.join().expect("producer");
    ring.close();
    let seen = consumer.join().expect("consumer");
    // No frame skipped, none duplicated, arrival order preserved.
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);

    let timeline: Vec<(&str, usize)> = events_rx.try_iter().collect();
    let position = |kind: &str, index: usize| {
        timeline
            .iter()
            .position(|&(k, i)| k == kind && i == index)
            .unwrap_or_else(|| panic!("missing {kind} {index} in {timeline:?}"))
    };
    for index in 1..5 {
        assert!(
            position("release", index - 1) < position("publish", index),
            "publish {index} preceded release {} in {timeline:?}",
            index - 1
        );
    }
}

/// A stage that never signals completion exhausts the retries x timeout
/// budget and raises the dedicated join error instead of hanging.
#[test]
fn stuck_stage_raises_join_timeout_within_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut funnel = LogFunnel::create(&dir.path().join("run.log"), false).expect("funnel");
    let log = funnel.sender();

    let stuck = std::thread::Builder::new()
        .name("stuck-stage".to_owned())
        .spawn(|| {
            // Simulates a deadlocked slot: never finishes on its own.
            std::thread::sleep(Duration::from_secs(600));
        })
        .expect("spawn");

    let started = Instant::now();
    let error = join_stage(stuck, "collector", Duration::from_millis(50), 3, &log).unwrap_err();
    let elapsed = started.elapsed();

    match &error {
        FpError::JoinTimeout { stage, waited_s } => {
            assert_eq!(stage, "collector");
            assert!(*waited_s >= 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // Bounded: three 50ms retries should come nowhere near the 600s sleep.
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");

    drop(log);
    funnel.close();
}

/// A finished stage joins promptly on the first attempt.
#[test]
fn join_stage_returns_once_the_stage_finishes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut funnel = LogFunnel::create(&dir.path().join("run.log"), false).expect("funnel");
    let log = funnel.sender();

    let quick = std::thread::spawn(|| std::thread::sleep(Duration::from_millis(30)));
    join_stage(quick, "segmentation", Duration::from_secs(5), 3, &log).expect("join");

    drop(log);
    funnel.close();
}

/// Debug mode pins the topology to one slot and one worker of each kind;
/// the pipeline still completes and stays ordered.
#[test]
fn debug_mode_runs_serially_and_completes() {
    helpers::register_test_algorithms();
    let dir = tempfile::tempdir().expect("tempdir");
    let path_in = dir.path().join("raw.fpz");
    let path_out = dir.path().join("processed.fpz");
    helpers::write_flat_input(&path_in, 25);

    let mut job = helpers::test_job(path_in, path_out.clone());
    job.segmenter = StageSelect::new("whole-frame");
    job.extractor = StageSelect::new("frame-echo");
    job.debug = true;

    JobRunner::new(job).expect("runner").run().expect("run");
    let data = Dataset::open(&path_out, &DataOptions::default()).expect("open");
    let indices = data.scalar("frame_index").expect("column");
    let expected: Vec<f64> = (0..25).map(|i| i as f64).collect();
    assert_eq!(indices, expected);
}
