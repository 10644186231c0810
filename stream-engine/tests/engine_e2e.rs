//! End-to-end: a wire-protocol camera served over TCP, recorded to disk,
//! rotated, indexed and survivable across an engine restart.

use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use stream_engine::{
    EngineConfig, RecordingEngine, SegmentQuery, StreamConfig, TcpConnector, WireFrame,
};

/// Serve one connection with `seconds` of 10 fps video, keyframe every 2 s,
/// then close. Further connects are refused once the listener drops.
fn serve_camera(seconds: i64) -> (std::net::SocketAddr, std::thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        for i in 0..seconds * 10 {
            let pts = (i * 100) as u64;
            let frame = WireFrame {
                sequence: i as u32,
                pts_ms: pts,
                is_keyframe: pts % 2000 == 0,
                is_audio: false,
                payload: Bytes::from(vec![0x37; 48]),
            };
            if sock.write_all(&frame.encode()).is_err() {
                return;
            }
        }
    });
    (addr, handle)
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_record_rotate_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, server) = serve_camera(30);

    let mut engine_config = EngineConfig::new(dir.path());
    engine_config.backoff_initial_secs = 1;
    let engine =
        RecordingEngine::new(engine_config.clone(), Arc::new(TcpConnector::default())).unwrap();

    let mut stream = StreamConfig::new("cam-e2e", format!("tcp://{addr}"));
    stream.fps = 10;
    stream.segment_duration = 10;
    engine.create_stream(&stream).unwrap();

    engine.start().unwrap();

    // two rotations land while the camera is live
    wait_for("two complete segments", || {
        engine
            .catalog()
            .count_segments(&SegmentQuery {
                complete_only: true,
                ..Default::default()
            })
            .unwrap()
            >= 2
    });
    server.join().unwrap();
    engine.shutdown();

    // the tail segment closed on shutdown; nothing is left in flight
    let segments = engine
        .catalog()
        .list_segments(&SegmentQuery::stream("cam-e2e"))
        .unwrap();
    assert_eq!(segments.len(), 3);
    for segment in &segments {
        assert!(segment.is_complete);
        let meta = std::fs::metadata(&segment.file_path).unwrap();
        assert_eq!(meta.len(), segment.size_bytes);
        assert!(segment.end_time.unwrap() >= segment.start_time);
    }

    // rotation was keyframe-aligned at 10 s boundaries
    assert_eq!(segments[0].end_time.unwrap() - segments[0].start_time, 10);
    assert_eq!(segments[1].end_time.unwrap() - segments[1].start_time, 10);

    let parts: Vec<_> = segment_store::scan_files(&dir.path().join("recordings"))
        .unwrap()
        .into_iter()
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("part"))
        .collect();
    assert!(parts.is_empty(), "leftover part files: {parts:?}");

    drop(engine);

    // a fresh engine over the same storage sees a coherent catalog and has
    // nothing to repair
    let engine2 =
        RecordingEngine::new(engine_config, Arc::new(TcpConnector::default())).unwrap();
    let before = engine2
        .catalog()
        .list_segments(&SegmentQuery::default())
        .unwrap();
    // recovery runs inside start(); stop the worker again right away
    engine2.delete_stream("cam-e2e", false).unwrap();
    engine2.start().unwrap();
    engine2.shutdown();

    let after = engine2
        .catalog()
        .list_segments(&SegmentQuery::default())
        .unwrap();
    assert_eq!(before.len(), after.len());
    assert!(after.iter().all(|s| s.is_complete));

    // playback handles serve the finished files
    let handle = engine2.open_for_read(after[0].id).unwrap();
    assert_eq!(handle.mime, "video/mp4");
    assert!(handle.size_bytes > 0);

    // and the timeline covers the recorded range
    let t0 = after.iter().map(|s| s.start_time).min().unwrap();
    let t1 = after.iter().flat_map(|s| s.end_time).max().unwrap();
    let manifest_path = engine2
        .build_timeline_manifest("cam-e2e", t0, t1)
        .unwrap();
    let manifest = std::fs::read_to_string(manifest_path).unwrap();
    assert_eq!(manifest.matches("#EXTINF").count(), 3);
}
