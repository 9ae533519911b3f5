use crate::calibration::{
    load_chain_or_default, CalibrationPolicy, CalibrationVerdict, CancelFlag, FilterChainStore,
    MemoryStore, SharedChain,
};
use crate::calibrator::{CalibrationProgress, Calibrator};
use crate::error::{CalibrationError, InferenceError};
use crate::filters::FilterCatalog;
use crate::fret_tracker::{FretTracker, TrackerConfig};
use crate::inference::Detector;
use crate::notes::ScaleState;
use crate::overlay::{HighlightState, OverlayConfig, OverlayFrame, OverlayRenderer};
use crate::types::*;
use crossbeam_channel::{Receiver, Sender};
use image::RgbaImage;
use log::{debug, info, trace, warn};
use std::time::{Duration, Instant};

/// Everything the coordinator reacts to, in arrival order.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    /// A live camera frame
    Frame(CapturedFrame),
    /// Recorded detections, bypassing filtering and inference
    Detections(DetectionFrame),
    /// Run a calibration on the last captured frame
    Calibrate { cancel: CancelFlag },
    SetScale { root: Note, scale: String },
    SetHighlights(HighlightState),
}

/// Calibration and live inference are two states of one machine, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Calibrating,
    /// An accepted filter chain is active
    Calibrated,
}

/// Out-of-band notifications for a UI or the CLI.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorReport {
    ModeChanged(Mode),
    CalibrationProgress(CalibrationProgress),
    CalibrationFinished {
        result: CalibrationResult,
        verdict: CalibrationVerdict,
        persisted: bool,
    },
    CalibrationFailed(CalibrationError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub frames_processed: u64,
    /// Frames skipped because a newer one was already queued
    pub frames_dropped: u64,
    pub inference_failures: u64,
}

/// The coordinator receives FrameEvents (camera frames, recorded detections
/// and control requests), runs filtering, inference, fret tracking and
/// overlay layout, and fans the resulting OverlayFrames out to consumers.
///
/// Each frame reads one snapshot of the shared filter chain, so a chain
/// swapped in by calibration never applies to half a frame. When frames
/// queue up behind a slow inference call only the newest is processed.
pub struct Coordinator<D: Detector> {
    input_rx: Receiver<FrameEvent>,
    overlay_txs: Vec<Sender<OverlayFrame>>,
    record_tx: Option<Sender<DetectionFrame>>,
    report_tx: Option<Sender<CoordinatorReport>>,
    detector: D,
    catalog: FilterCatalog,
    chain: SharedChain,
    store: Box<dyn FilterChainStore>,
    policy: CalibrationPolicy,
    tracker: FretTracker,
    renderer: OverlayRenderer,
    scale: ScaleState,
    highlights: HighlightState,
    mode: Mode,
    /// Unfiltered copy of the newest frame, the calibration reference
    last_frame: Option<RgbaImage>,
    pending: Option<FrameEvent>,
    epoch: Instant,
    stats: CoordinatorStats,
}

impl<D: Detector> Coordinator<D> {
    pub fn new(input_rx: Receiver<FrameEvent>, overlay_txs: Vec<Sender<OverlayFrame>>, detector: D) -> Self {
        Self {
            input_rx,
            overlay_txs,
            record_tx: None,
            report_tx: None,
            detector,
            catalog: FilterCatalog::calibration_default(),
            chain: SharedChain::default(),
            store: Box::new(MemoryStore::new()),
            policy: CalibrationPolicy::default(),
            tracker: FretTracker::new(TrackerConfig::default()),
            renderer: OverlayRenderer::default(),
            scale: ScaleState::default(),
            highlights: HighlightState::default(),
            mode: Mode::Idle,
            last_frame: None,
            pending: None,
            epoch: Instant::now(),
            stats: CoordinatorStats::default(),
        }
    }

    /// Filters calibration searches and the live chain may name. Set before
    /// `with_store` so the stored chain is validated against it.
    pub fn with_catalog(mut self, catalog: FilterCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Use `store` for persistence and load its chain. A non-empty stored
    /// chain starts the coordinator in `Calibrated`.
    pub fn with_store(mut self, store: Box<dyn FilterChainStore>) -> Self {
        let chain = load_chain_or_default(store.as_ref(), &self.catalog);
        if !chain.is_empty() {
            info!("Using stored filter chain: {}", describe_chain(&chain));
            self.mode = Mode::Calibrated;
        }
        self.chain.replace(chain);
        self.store = store;
        self
    }

    /// Share the live chain with another owner (e.g. a UI showing it).
    pub fn with_shared_chain(mut self, chain: SharedChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_policy(mut self, policy: CalibrationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tracker(mut self, config: TrackerConfig) -> Self {
        self.tracker = FretTracker::new(config);
        self
    }

    pub fn with_overlay(mut self, config: OverlayConfig) -> Self {
        self.renderer = OverlayRenderer::new(config);
        self
    }

    pub fn with_scale(mut self, scale: ScaleState) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_recorder(mut self, tx: Sender<DetectionFrame>) -> Self {
        self.record_tx = Some(tx);
        self
    }

    pub fn with_reports(mut self, tx: Sender<CoordinatorReport>) -> Self {
        self.report_tx = Some(tx);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    pub fn shared_chain(&self) -> SharedChain {
        self.chain.clone()
    }

    pub fn tracker(&self) -> &FretTracker {
        &self.tracker
    }

    pub fn scale(&self) -> &ScaleState {
        &self.scale
    }

    /// Process events until every sender has hung up. Blocks the calling thread.
    pub fn run(&mut self) -> CoordinatorStats {
        info!("Coordinator running (mode {:?}, chain {})", self.mode, describe_chain(&self.chain.snapshot()));
        loop {
            let event = match self.pending.take() {
                Some(event) => event,
                None => match self.input_rx.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            self.handle(event);
        }
        info!(
            "Coordinator shutting down: {} frames processed, {} dropped, {} inference failures",
            self.stats.frames_processed, self.stats.frames_dropped, self.stats.inference_failures
        );
        self.stats
    }

    pub fn handle(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::Frame(frame) => {
                let frame = self.newest_frame(frame);
                self.process_frame(frame);
            }
            FrameEvent::Detections(frame) => {
                self.process_detections(frame);
            }
            FrameEvent::Calibrate { cancel } => {
                let _ = self.calibrate(cancel);
            }
            FrameEvent::SetScale { root, scale } => {
                if self.scale.set_scale(root, &scale) {
                    info!("Scale: {} {}", root, scale);
                }
            }
            FrameEvent::SetHighlights(highlights) => {
                trace!("highlights: {:?}", highlights);
                self.highlights = highlights;
            }
        }
    }

    /// Skip past frames already queued behind `frame`. Stops at the first
    /// control event so it still applies after the frame it followed.
    fn newest_frame(&mut self, mut frame: CapturedFrame) -> CapturedFrame {
        if self.pending.is_some() {
            return frame;
        }
        while let Ok(next) = self.input_rx.try_recv() {
            match next {
                FrameEvent::Frame(newer) => {
                    self.stats.frames_dropped += 1;
                    frame = newer;
                }
                other => {
                    self.pending = Some(other);
                    break;
                }
            }
        }
        frame
    }

    /// Filter, detect, track and lay out one live frame. `None` when
    /// inference fails; the frame is skipped and the loop carries on.
    pub fn process_frame(&mut self, frame: CapturedFrame) -> Option<OverlayFrame> {
        let chain = self.chain.snapshot();
        let mut image = frame.image.clone();
        if let Err(e) = self.catalog.apply_chain(&mut image, &chain) {
            warn!("Filter chain failed ({}); using unfiltered frame", e);
            image = frame.image.clone();
        }
        let frame_height = image.height() as f32;
        let result = self.detector.infer(&image);
        self.last_frame = Some(frame.image);

        match result {
            Ok(detections) => {
                let detections = DetectionFrame {
                    t: frame.timestamp_ms,
                    frame_height,
                    detections,
                };
                Some(self.ingest(detections, frame.captured_at))
            }
            Err(e @ (InferenceError::Busy | InferenceError::NotReady)) => {
                debug!("{}; frame {} skipped", e, frame.timestamp_ms);
                self.stats.inference_failures += 1;
                None
            }
            Err(e) => {
                warn!("Inference failed at {}ms: {}", frame.timestamp_ms, e);
                self.stats.inference_failures += 1;
                None
            }
        }
    }

    /// Track and lay out recorded detections. Time comes from the frame's
    /// timestamp, so replays throttle the same way the live session did.
    pub fn process_detections(&mut self, frame: DetectionFrame) -> OverlayFrame {
        let now = self.epoch + Duration::from_millis(frame.t);
        self.ingest(frame, now)
    }

    fn ingest(&mut self, frame: DetectionFrame, now: Instant) -> OverlayFrame {
        if let Some(tx) = &self.record_tx {
            let _ = tx.send(frame.clone());
        }
        self.tracker.update_at(&frame.detections, frame.frame_height, now);
        let mut overlay =
            self.renderer
                .render_frets(self.tracker.stable_frets(), &self.scale, &self.highlights);
        overlay.timestamp_ms = frame.t;
        for tx in &self.overlay_txs {
            let _ = tx.send(overlay.clone());
        }

        self.stats.frames_processed += 1;
        if self.stats.frames_processed % 100 == 0 {
            debug!("Coordinator: {} frames processed", self.stats.frames_processed);
            trace!("Latest: {} zones, {} points", overlay.zone_count, overlay.points.len());
        }
        overlay
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            info!("Mode {:?} → {:?}", self.mode, mode);
            self.mode = mode;
            self.report(CoordinatorReport::ModeChanged(mode));
        }
    }

    fn report(&self, report: CoordinatorReport) {
        if let Some(tx) = &self.report_tx {
            let _ = tx.send(report);
        }
    }

    /// Calibrate on the last captured frame. An accepted result is persisted
    /// and swapped in as the live chain; anything else leaves the live chain
    /// and mode as they were.
    pub fn calibrate(
        &mut self,
        cancel: CancelFlag,
    ) -> Result<(CalibrationResult, CalibrationVerdict), CalibrationError> {
        let Some(reference) = self.last_frame.clone() else {
            warn!("Calibration requested before any frame was captured");
            self.report(CoordinatorReport::CalibrationFailed(CalibrationError::NoReferenceFrame));
            return Err(CalibrationError::NoReferenceFrame);
        };
        let previous = self.mode;
        self.set_mode(Mode::Calibrating);

        let report_tx = self.report_tx.clone();
        let outcome = Calibrator::new(&self.catalog)
            .with_cancel(cancel)
            .run(&reference, &mut self.detector, |progress| {
                if let Some(tx) = &report_tx {
                    let _ = tx.send(CoordinatorReport::CalibrationProgress(progress.clone()));
                }
            });

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                self.set_mode(previous);
                self.report(CoordinatorReport::CalibrationFailed(e.clone()));
                return Err(e);
            }
        };

        let verdict = self.policy.verdict(&result);
        let mut persisted = false;
        match verdict {
            CalibrationVerdict::Accepted => {
                persisted = match self.store.save(&result.filter_chain) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Could not persist filter chain: {}", e);
                        false
                    }
                };
                self.chain.replace(result.filter_chain.clone());
                self.tracker.reset();
                self.set_mode(Mode::Calibrated);
            }
            CalibrationVerdict::NoGuitarDetected => {
                warn!(
                    "No guitar detected (baseline {:.2}); check framing and retry",
                    result.baseline_confidence
                );
                self.set_mode(previous);
            }
            CalibrationVerdict::BelowTarget => {
                warn!(
                    "Best chain reached {:.2}, below target {:.2}; retry calibration",
                    result.achieved_confidence, self.policy.success_threshold
                );
                self.set_mode(previous);
            }
        }
        self.report(CoordinatorReport::CalibrationFinished {
            result: result.clone(),
            verdict,
            persisted,
        });
        Ok((result, verdict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{render_scene, Scene, SceneHandle, SimulatedDetector};
    use crate::filters::luma_stats;
    use crossbeam_channel::unbounded;
    use image::Rgba;

    const W: u32 = 320;
    const H: u32 = 240;

    fn captured(t: u64, scene: &Scene) -> CapturedFrame {
        CapturedFrame {
            timestamp_ms: t,
            captured_at: Instant::now() + Duration::from_millis(t),
            image: render_scene(scene, W, H),
        }
    }

    fn coordinator(
        rx: Receiver<FrameEvent>,
    ) -> (Coordinator<SimulatedDetector>, Receiver<OverlayFrame>) {
        let (tx, out) = unbounded();
        let det = SimulatedDetector::new(SceneHandle::default(), W, H);
        (Coordinator::new(rx, vec![tx], det), out)
    }

    #[test]
    fn test_frame_produces_overlay() {
        let (_tx, rx) = unbounded();
        let (mut coord, out) = coordinator(rx);
        let overlay = coord.process_frame(captured(0, &Scene::default())).unwrap();
        assert!(overlay.zone_count > 0);
        assert_eq!(overlay.points.len(), overlay.zone_count * NUM_STRINGS);
        assert_eq!(out.try_recv().unwrap(), overlay);
        assert_eq!(coord.stats().frames_processed, 1);
    }

    #[test]
    fn test_stale_frames_dropped() {
        let (tx, rx) = unbounded();
        let (mut coord, out) = coordinator(rx);
        for t in [100, 200, 300] {
            tx.send(FrameEvent::Frame(captured(t, &Scene::default()))).unwrap();
        }
        drop(tx);
        let stats = coord.run();
        assert_eq!(stats.frames_processed, 1);
        assert_eq!(stats.frames_dropped, 2);
        assert_eq!(out.try_recv().unwrap().timestamp_ms, 300);
    }

    #[test]
    fn test_control_event_not_reordered() {
        let (tx, rx) = unbounded();
        let (mut coord, out) = coordinator(rx);
        tx.send(FrameEvent::Frame(captured(100, &Scene::default()))).unwrap();
        tx.send(FrameEvent::SetScale { root: Note::A, scale: "minor".into() }).unwrap();
        tx.send(FrameEvent::Frame(captured(200, &Scene::default()))).unwrap();
        drop(tx);
        coord.run();
        let frames: Vec<OverlayFrame> = out.try_iter().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(coord.scale().root(), Note::A);
        let roots = |f: &OverlayFrame| {
            f.points.iter().filter(|p| p.category == NoteCategory::Root).map(|p| p.note).next()
        };
        assert_ne!(roots(&frames[0]), Some(Note::A));
        assert!(frames[1].points.iter().all(|p| p.category != NoteCategory::Root || p.note == Note::A));
    }

    #[test]
    fn test_calibration_without_frame() {
        let (_tx, rx) = unbounded();
        let (mut coord, _out) = coordinator(rx);
        assert_eq!(
            coord.calibrate(CancelFlag::new()),
            Err(CalibrationError::NoReferenceFrame)
        );
        assert_eq!(coord.mode(), Mode::Idle);
    }

    /// Confidence peaks when mean luma is mid-grey.
    struct GreyDetector {
        seen: Vec<f32>,
    }

    impl Detector for GreyDetector {
        fn infer(&mut self, image: &RgbaImage) -> Result<Vec<Detection>, InferenceError> {
            let (mean, _) = luma_stats(image);
            self.seen.push(mean);
            let conf = 1.0 - (mean - 128.0).abs() / 128.0;
            let bbox = BBox { x: 60.0, y: 40.0, width: 40.0, height: 60.0 };
            Ok(vec![Detection::bbox("Zone1", conf, bbox)])
        }
    }

    fn grey(level: u8) -> CapturedFrame {
        CapturedFrame {
            timestamp_ms: 0,
            captured_at: Instant::now(),
            image: RgbaImage::from_pixel(16, 16, Rgba([level, level, level, 255])),
        }
    }

    fn grey_coordinator(rx: Receiver<FrameEvent>) -> Coordinator<GreyDetector> {
        Coordinator::new(rx, Vec::new(), GreyDetector { seen: Vec::new() })
    }

    #[test]
    fn test_dark_frame_calibrates_and_swaps_chain() {
        let (_tx, rx) = unbounded();
        let (reports_tx, reports) = unbounded();
        let mut coord = grey_coordinator(rx).with_reports(reports_tx);
        coord.process_frame(grey(68));

        let (result, verdict) = coord.calibrate(CancelFlag::new()).unwrap();
        assert_eq!(verdict, CalibrationVerdict::Accepted);
        assert_eq!(
            result.filter_chain,
            vec![FilterStep::new("brightness", FilterParam::Number(60.0))]
        );
        assert_eq!(coord.mode(), Mode::Calibrated);
        assert_eq!(*coord.shared_chain().snapshot(), result.filter_chain);

        // the next live frame goes through the new chain
        coord.process_frame(grey(68));
        let last = *coord.detector.seen.last().unwrap();
        assert!((last - 128.0).abs() < 1.0, "got {}", last);

        let all: Vec<CoordinatorReport> = reports.try_iter().collect();
        assert_eq!(all.first(), Some(&CoordinatorReport::ModeChanged(Mode::Calibrating)));
        assert!(all.iter().any(|r| matches!(r, CoordinatorReport::CalibrationProgress(_))));
        assert!(all.contains(&CoordinatorReport::ModeChanged(Mode::Calibrated)));
        assert!(matches!(
            all.last(),
            Some(CoordinatorReport::CalibrationFinished { persisted: true, .. })
        ));
    }

    #[test]
    fn test_calibration_uses_unfiltered_reference() {
        let (_tx, rx) = unbounded();
        let mut coord = grey_coordinator(rx)
            .with_shared_chain(SharedChain::new(vec![FilterStep::new("invert", FilterParam::Flag(true))]));
        coord.process_frame(grey(68));
        let (result, _) = coord.calibrate(CancelFlag::new()).unwrap();
        assert!((result.baseline_confidence - (1.0 - 60.0 / 128.0)).abs() < 1e-3);
    }

    #[test]
    fn test_no_guitar_keeps_mode() {
        let (_tx, rx) = unbounded();
        let (mut coord, _out) = coordinator(rx);
        // flat black frame: no texture survives any filter
        coord.process_frame(CapturedFrame {
            timestamp_ms: 0,
            captured_at: Instant::now(),
            image: RgbaImage::from_pixel(W, H, Rgba([0, 0, 0, 255])),
        });
        let (result, verdict) = coord.calibrate(CancelFlag::new()).unwrap();
        assert_eq!(result.baseline_confidence, 0.0);
        assert_eq!(verdict, CalibrationVerdict::NoGuitarDetected);
        assert_eq!(coord.mode(), Mode::Idle);
    }

    #[test]
    fn test_rejected_calibration_keeps_mode() {
        let (_tx, rx) = unbounded();
        let mut coord = grey_coordinator(rx).with_policy(CalibrationPolicy {
            success_threshold: 1.5,
            no_guitar_threshold: 0.3,
        });
        coord.process_frame(grey(68));
        let (_, verdict) = coord.calibrate(CancelFlag::new()).unwrap();
        assert_eq!(verdict, CalibrationVerdict::BelowTarget);
        assert_eq!(coord.mode(), Mode::Idle);
        assert!(coord.shared_chain().snapshot().is_empty());
    }

    #[test]
    fn test_cancelled_calibration() {
        let (_tx, rx) = unbounded();
        let (mut coord, _out) = coordinator(rx);
        coord.process_frame(captured(0, &Scene::default()));
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert_eq!(coord.calibrate(cancel), Err(CalibrationError::Cancelled));
        assert_eq!(coord.mode(), Mode::Idle);
    }

    #[test]
    fn test_stored_chain_starts_calibrated() {
        let (_tx, rx) = unbounded();
        let (coord, _out) = coordinator(rx);
        let mut store = MemoryStore::new();
        store
            .save(&[FilterStep::new("brightness", FilterParam::Number(30.0))])
            .unwrap();
        let coord = coord.with_store(Box::new(store));
        assert_eq!(coord.mode(), Mode::Calibrated);
        assert_eq!(coord.shared_chain().snapshot().len(), 1);
    }

    #[test]
    fn test_replay_records_and_throttles() {
        let (_tx, rx) = unbounded();
        let (rec_tx, rec_rx) = unbounded();
        let (coord, _out) = coordinator(rx);
        let mut coord = coord.with_recorder(rec_tx);
        let zone = Detection::bbox("Zone1", 0.9, BBox { x: 100.0, y: 50.0, width: 40.0, height: 40.0 });
        let frame = |t| DetectionFrame { t, frame_height: 240.0, detections: vec![zone.clone()] };
        assert_eq!(coord.process_detections(frame(0)).zone_count, 1);
        // inside the 33ms throttle: stable list unchanged
        let empty = DetectionFrame { t: 10, frame_height: 240.0, detections: vec![] };
        assert_eq!(coord.process_detections(empty).zone_count, 1);
        let empty = DetectionFrame { t: 100, frame_height: 240.0, detections: vec![] };
        assert_eq!(coord.process_detections(empty).zone_count, 0);
        assert_eq!(rec_rx.try_iter().count(), 3);
    }
}
