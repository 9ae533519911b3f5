//! End-to-end integration tests for the fret-vision pipeline.
//!
//! These tests exercise the full data flow:
//!   frames → FrameEvent channel → Coordinator → OverlayFrame channel → assertions
//!
//! Frames come from the synthetic scene renderer and are "seen" by the
//! simulated detector, so filtering, calibration and fret tracking all run
//! on real pixels.

use crossbeam_channel::{bounded, unbounded};
use std::fs::File;
use std::io::BufReader;
use std::thread;
use std::time::{Duration, Instant};

use fret_vision::calibration::{
    CalibrationPolicy, CalibrationVerdict, CancelFlag, FilterChainStore, JsonFileStore,
};
use fret_vision::calibrator::avg_confidence;
use fret_vision::coordinator::{Coordinator, CoordinatorReport, CoordinatorStats, FrameEvent, Mode};
use fret_vision::data_logger::DataLogger;
use fret_vision::inference::{InferenceService, ServiceStatus};
use fret_vision::jsonl_reader::SessionReader;
use fret_vision::overlay::{FretPosition, OverlayFrame};
use fret_vision::play_along::{preset, PlayAlong};
use fret_vision::simulator::{
    render_scene, Scene, SceneHandle, SimulatedDetector, Simulator, FRAME_HEIGHT, FRAME_WIDTH,
    VISIBLE_FRETS,
};
use fret_vision::types::*;

// ─── Helpers ───────────────────────────────────────────────────────────────

/// A captured frame of `scene` at session time `t` ms. `captured_at` follows
/// `t` so tracker throttling is the same live and on replay.
fn frame_at(base: Instant, t: u64, scene: &Scene) -> FrameEvent {
    FrameEvent::Frame(CapturedFrame {
        timestamp_ms: t,
        captured_at: base + Duration::from_millis(t),
        image: render_scene(scene, FRAME_WIDTH, FRAME_HEIGHT),
    })
}

fn detector() -> SimulatedDetector {
    SimulatedDetector::new(SceneHandle::default(), FRAME_WIDTH, FRAME_HEIGHT)
}

struct PipelineOutput {
    overlays: Vec<OverlayFrame>,
    recorded: Vec<DetectionFrame>,
    reports: Vec<CoordinatorReport>,
    stats: CoordinatorStats,
    chain: FilterChain,
}

/// Run a coordinator in a background thread, feeding it a sequence of events
/// (all queued before it starts). Collects everything it emits until the
/// input channel closes.
fn run_pipeline<F>(events: Vec<FrameEvent>, configure: F) -> PipelineOutput
where
    F: FnOnce(Coordinator<SimulatedDetector>) -> Coordinator<SimulatedDetector> + Send + 'static,
{
    let (input_tx, input_rx) = bounded::<FrameEvent>(events.len().max(1));
    let (overlay_tx, overlay_rx) = unbounded::<OverlayFrame>();
    let (record_tx, record_rx) = unbounded::<DetectionFrame>();
    let (report_tx, report_rx) = unbounded::<CoordinatorReport>();

    for event in events {
        input_tx.send(event).unwrap();
    }
    drop(input_tx);

    let handle = thread::Builder::new()
        .name("test-coordinator".into())
        .spawn(move || {
            let coord = Coordinator::new(input_rx, vec![overlay_tx], detector())
                .with_recorder(record_tx)
                .with_reports(report_tx);
            let mut coord = configure(coord);
            let stats = coord.run();
            (stats, coord.shared_chain().snapshot().to_vec())
        })
        .unwrap();

    let (stats, chain) = handle.join().expect("coordinator thread panicked");
    PipelineOutput {
        overlays: overlay_rx.try_iter().collect(),
        recorded: record_rx.try_iter().collect(),
        reports: report_rx.try_iter().collect(),
        stats,
        chain,
    }
}

fn count(overlay: &OverlayFrame, category: NoteCategory) -> usize {
    overlay.points.iter().filter(|p| p.category == category).count()
}

// ─── Live pipeline ─────────────────────────────────────────────────────────

#[test]
fn test_neutral_scene_tracks_every_fret() {
    let base = Instant::now();
    let events = (0..5).map(|i| frame_at(base, i * 100, &Scene::default())).collect();
    let out = run_pipeline(events, |c| c);

    // queued frames collapse to the newest
    assert_eq!(out.stats.frames_processed + out.stats.frames_dropped, 5);
    assert!(!out.overlays.is_empty());
    let last = out.overlays.last().unwrap();
    assert_eq!(last.timestamp_ms, 400);
    assert_eq!(last.zone_count, VISIBLE_FRETS as usize);
    assert_eq!(last.points.len(), VISIBLE_FRETS as usize * NUM_STRINGS);
    assert!(last.angle.abs() < 0.01);
    assert!(count(last, NoteCategory::Root) > 0);
    assert!(count(last, NoteCategory::Other) > 0);
}

#[test]
fn test_simulator_feeds_coordinator() {
    let clock = SessionClock::new();
    let (input_tx, input_rx) = bounded::<FrameEvent>(4);
    let (overlay_tx, overlay_rx) = unbounded::<OverlayFrame>();

    let mut sim = Simulator::new(clock, input_tx, 200).with_frame_limit(6);
    let service = InferenceService::ready(sim.detector());
    let sim_handle = thread::Builder::new()
        .name("test-simulator".into())
        .spawn(move || sim.run())
        .unwrap();
    let coord_handle = thread::Builder::new()
        .name("test-coordinator".into())
        .spawn(move || Coordinator::new(input_rx, vec![overlay_tx], service).run())
        .unwrap();

    assert_eq!(sim_handle.join().unwrap(), 6);
    let stats = coord_handle.join().unwrap();
    assert_eq!(stats.frames_processed + stats.frames_dropped, 6);
    assert_eq!(stats.inference_failures, 0);

    let overlays: Vec<OverlayFrame> = overlay_rx.try_iter().collect();
    assert_eq!(overlays.len() as u64, stats.frames_processed);
    assert!(overlays.iter().all(|o| o.zone_count == VISIBLE_FRETS as usize));
}

#[test]
fn test_tilted_closer_camera() {
    let base = Instant::now();
    let scene = Scene { tilt: 0.1, zoom: 1.1, ..Scene::default() };
    let out = run_pipeline(vec![frame_at(base, 0, &scene)], |c| c);
    let overlay = &out.overlays[0];
    assert!(overlay.zone_count > 0);
    assert!((overlay.angle - 0.1).abs() < 0.03, "angle {}", overlay.angle);
}

#[test]
fn test_hand_is_not_a_fret() {
    let base = Instant::now();
    let scene = SceneHandle::default();
    scene.update(|s| s.hand = true);
    let (_tx, rx) = unbounded();
    let mut coord =
        Coordinator::new(rx, Vec::new(), SimulatedDetector::new(scene, FRAME_WIDTH, FRAME_HEIGHT));

    let FrameEvent::Frame(frame) = frame_at(base, 0, &Scene { hand: true, ..Scene::default() }) else {
        unreachable!()
    };
    let overlay = coord.process_frame(frame).unwrap();
    assert_eq!(overlay.zone_count, VISIBLE_FRETS as usize);
    assert_eq!(coord.tracker().stable_frets().len(), VISIBLE_FRETS as usize);
}

#[test]
fn test_detector_not_ready_skips_frames() {
    let base = Instant::now();
    let service = std::sync::Arc::new(InferenceService::<SimulatedDetector>::new());
    let status = service.subscribe();
    let (_tx, rx) = unbounded();
    let mut coord = Coordinator::new(rx, Vec::new(), service.clone());

    let frame = |t| match frame_at(base, t, &Scene::default()) {
        FrameEvent::Frame(f) => f,
        _ => unreachable!(),
    };
    assert!(coord.process_frame(frame(0)).is_none());
    assert_eq!(coord.stats().inference_failures, 1);

    assert_eq!(service.start(|| Ok(detector())), ServiceStatus::Ready);
    let overlay = coord.process_frame(frame(100)).unwrap();
    assert_eq!(overlay.zone_count, VISIBLE_FRETS as usize);

    let seen: Vec<ServiceStatus> = status.try_iter().collect();
    assert_eq!(
        seen,
        vec![ServiceStatus::NotStarted, ServiceStatus::Loading, ServiceStatus::Ready]
    );
}

// ─── Scale and highlights ──────────────────────────────────────────────────

#[test]
fn test_scale_change_mid_stream() {
    let base = Instant::now();
    let events = vec![
        frame_at(base, 0, &Scene::default()),
        FrameEvent::SetScale { root: Note::A, scale: "pentatonic_minor".into() },
        frame_at(base, 100, &Scene::default()),
        // unknown scales leave the current one in place
        FrameEvent::SetScale { root: Note::D, scale: "no_such_scale".into() },
        frame_at(base, 200, &Scene::default()),
    ];
    let out = run_pipeline(events, |c| c);
    assert_eq!(out.overlays.len(), 3);

    let roots = |o: &OverlayFrame| -> Vec<Note> {
        o.points.iter().filter(|p| p.category == NoteCategory::Root).map(|p| p.note).collect()
    };
    assert!(roots(&out.overlays[0]).iter().all(|&n| n == Note::C));
    assert!(roots(&out.overlays[1]).iter().all(|&n| n == Note::A));
    assert_eq!(roots(&out.overlays[1]), roots(&out.overlays[2]));
    // five-note scale: fewer in-scale points than seven-note major
    assert!(
        count(&out.overlays[1], NoteCategory::InScale) < count(&out.overlays[0], NoteCategory::InScale)
    );
}

#[test]
fn test_play_along_highlights() {
    let base = Instant::now();
    let mut play = PlayAlong::new(preset("C Major Triad").unwrap());
    play.start(0);
    let events = vec![
        FrameEvent::SetHighlights(play.highlight_state()),
        frame_at(base, 0, &Scene::default()),
    ];
    let out = run_pipeline(events, |c| c);
    let overlay = &out.overlays[0];

    let lit: Vec<FretPosition> = overlay
        .points
        .iter()
        .filter(|p| p.category == NoteCategory::Highlighted)
        .map(|p| FretPosition::new(p.string_index, p.fret_number))
        .collect();
    // first step: A string, 3rd fret
    assert_eq!(lit, vec![FretPosition::new(1, 3)]);
    // open G (3, 0) is drawn on the first tracked fret
    let g1 = overlay
        .points
        .iter()
        .find(|p| p.string_index == 3 && p.fret_number == 1)
        .unwrap();
    assert_eq!(g1.category, NoteCategory::Arpeggio);

    play.tick(5000);
    assert!(play.highlight_state().highlighted.is_empty());
}

// ─── Calibration ───────────────────────────────────────────────────────────

#[test]
fn test_calibration_recovers_dim_scene() {
    let base = Instant::now();
    let dir = tempfile::tempdir().unwrap();
    let chain_path = dir.path().join("chain.json");
    let store_path = chain_path.clone();

    let dim = Scene { exposure: 0.55, ..Scene::default() };
    let events = vec![
        frame_at(base, 0, &dim),
        FrameEvent::Calibrate { cancel: CancelFlag::new() },
        frame_at(base, 100, &dim),
    ];
    let out = run_pipeline(events, move |c| {
        c.with_store(Box::new(JsonFileStore::new(store_path)))
            .with_policy(CalibrationPolicy { success_threshold: 0.0, no_guitar_threshold: 0.3 })
    });

    assert_eq!(out.reports.first(), Some(&CoordinatorReport::ModeChanged(Mode::Calibrating)));
    let Some(CoordinatorReport::CalibrationFinished { result, verdict, persisted }) =
        out.reports.last().cloned()
    else {
        panic!("no calibration result in {:?}", out.reports);
    };
    assert_eq!(verdict, CalibrationVerdict::Accepted);
    assert!(persisted);
    assert!(result.achieved_confidence > result.baseline_confidence);
    assert_eq!(result.filter_chain[0].filter, "brightness");
    assert_eq!(out.chain, result.filter_chain);

    // the stored record round-trips
    let stored = JsonFileStore::new(chain_path).load().unwrap().unwrap();
    assert_eq!(stored, result.filter_chain);

    // the frame after calibration sees the new chain
    assert_eq!(out.recorded.len(), 2);
    let before = avg_confidence(&out.recorded[0].detections);
    let after = avg_confidence(&out.recorded[1].detections);
    assert!(after > before, "{} → {}", before, after);
}

#[test]
fn test_calibration_before_any_frame() {
    let out = run_pipeline(vec![FrameEvent::Calibrate { cancel: CancelFlag::new() }], |c| c);
    assert_eq!(
        out.reports,
        vec![CoordinatorReport::CalibrationFailed(fret_vision::error::CalibrationError::NoReferenceFrame)]
    );
    assert!(out.chain.is_empty());
}

// ─── Recording and replay ──────────────────────────────────────────────────

#[test]
fn test_recorded_session_replays_identically() {
    let base = Instant::now();
    let dir = tempfile::tempdir().unwrap();

    // live: one frame per event, gestures between frames
    let mut events = Vec::new();
    for (i, scene) in [
        Scene::default(),
        Scene { tilt: 0.05, ..Scene::default() },
        Scene { tilt: 0.1, zoom: 1.1, ..Scene::default() },
        Scene { hand: true, ..Scene::default() },
    ]
    .iter()
    .enumerate()
    {
        events.push(frame_at(base, i as u64 * 20, scene));
        // keeps frames from collapsing
        events.push(FrameEvent::SetHighlights(Default::default()));
    }
    let live = run_pipeline(events, |c| c);
    assert_eq!(live.stats.frames_dropped, 0);

    let (tx, rx) = unbounded();
    let logger = DataLogger::new(rx, dir.path(), 50, "Standard").unwrap();
    for frame in &live.recorded {
        tx.send(frame.clone()).unwrap();
    }
    drop(tx);
    assert_eq!(logger.run().unwrap(), live.recorded.len() as u64);

    let reader = SessionReader::open(BufReader::new(File::open(logger.detections_path()).unwrap())).unwrap();
    let replay_events = reader.map(|f| FrameEvent::Detections(f.unwrap())).collect();
    let replay = run_pipeline(replay_events, |c| c);

    assert_eq!(replay.overlays.len(), live.overlays.len());
    for (a, b) in live.overlays.iter().zip(&replay.overlays) {
        assert_eq!(a.timestamp_ms, b.timestamp_ms);
        assert_eq!(a.zone_count, b.zone_count);
        assert_eq!(a.points.len(), b.points.len());
        assert!((a.angle - b.angle).abs() < 1e-6);
    }
    // 20ms apart: the tracker only accepted every other update
    let zone_counts: Vec<usize> = replay.overlays.iter().map(|o| o.zone_count).collect();
    assert_eq!(zone_counts[0], zone_counts[1]);
}
