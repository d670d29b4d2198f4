//! Asynchronous execution: ordering, single-slot backpressure, one-frame
//! overlay latency.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{custom_pipeline, frame, wait_ready, BackendProbe, RecordingPost, ScriptedBackend};
use deeplens_core::VecSink;

#[test]
fn async_results_arrive_once_in_order_one_frame_late() {
    let probe = Arc::new(BackendProbe::default());
    let decoded = Arc::new(Mutex::new(Vec::new()));
    let dir = tempfile::tempdir().unwrap();
    let mut pipe = custom_pipeline(
        &dir,
        "Async",
        Box::new(ScriptedBackend::instant(Arc::clone(&probe))),
        Box::new(RecordingPost::new(Arc::clone(&decoded))),
    );

    let mut sink = VecSink::default();

    // first call builds the stages and kicks off the background load
    pipe.process(&frame(0), &mut sink, None, false);
    assert!(!pipe.ready(), "load is deliberately slow");
    wait_ready(&pipe);
    sink.lines.clear();

    // 10 frames at a leisurely camera cadence; the instant network finishes
    // well within each frame interval
    for i in 0..10u8 {
        pipe.process(&frame(i * 10), &mut sink, None, false);
        std::thread::sleep(Duration::from_millis(20));
    }
    // one more frame consumes the last in-flight result
    pipe.process(&frame(200), &mut sink, None, false);

    // every launched inference was decoded exactly once, in launch order
    let decoded = decoded.lock().unwrap();
    let expected: Vec<f32> = (0..10u8).map(|i| f32::from(i * 10)).collect();
    assert_eq!(&decoded[..10], expected.as_slice());

    // the overlay runs one frame behind: frame i reports frame i-1's value
    assert_eq!(sink.lines[0], "SEEN none");
    for i in 1..10 {
        assert_eq!(sink.lines[i], format!("SEEN {}", (i - 1) * 10));
    }

    assert!(
        !probe.overlap_seen.load(Ordering::SeqCst),
        "more than one inference was in flight"
    );
}

#[test]
fn slow_network_reports_stale_results_without_stacking_jobs() {
    let probe = Arc::new(BackendProbe::default());
    let decoded = Arc::new(Mutex::new(Vec::new()));
    let (backend, gate) = ScriptedBackend::gated(Arc::clone(&probe));
    let dir = tempfile::tempdir().unwrap();
    let mut pipe = custom_pipeline(
        &dir,
        "Async",
        Box::new(backend),
        Box::new(RecordingPost::new(Arc::clone(&decoded))),
    );

    let mut sink = VecSink::default();
    pipe.process(&frame(1), &mut sink, None, false);
    wait_ready(&pipe);
    sink.lines.clear();

    // frame 1 launches the (blocked) inference
    pipe.process(&frame(1), &mut sink, None, false);
    // frames 2 and 3 arrive while it is still running
    pipe.process(&frame(2), &mut sink, None, false);
    pipe.process(&frame(3), &mut sink, None, false);
    assert_eq!(
        sink.lines,
        vec!["SEEN none", "SEEN none", "SEEN none"],
        "no results may be reported while the first inference runs"
    );
    assert!(decoded.lock().unwrap().is_empty());

    // let it finish; the next frame consumes it and launches a new one
    gate.send(()).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    pipe.process(&frame(4), &mut sink, None, false);
    assert_eq!(sink.lines.last().unwrap(), "SEEN 1");
    assert_eq!(decoded.lock().unwrap().as_slice(), &[1.0]);

    assert!(!probe.overlap_seen.load(Ordering::SeqCst));

    // unblock the drain that happens when the pipeline shuts down
    let _ = gate.send(());
}
