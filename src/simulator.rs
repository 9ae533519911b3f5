use crate::coordinator::FrameEvent;
use crate::error::InferenceError;
use crate::filters::luma_stats;
use crate::inference::Detector;
use crate::types::*;
use crossbeam_channel::Sender;
use image::{Rgba, RgbaImage};
use log::{debug, info};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const FRAME_WIDTH: u32 = 640;
pub const FRAME_HEIGHT: u32 = 480;
/// Zones drawn on the synthetic neck, numbered from the nut.
pub const VISIBLE_FRETS: u32 = 8;

const NUT_X: f32 = 40.0;
const SCALE_LENGTH: f32 = 1400.0;
const NECK_HEIGHT: f32 = 120.0;

/// Camera and lighting conditions of the synthetic scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scene {
    /// Multiplier on pixel values (1.0 = neutral)
    pub exposure: f32,
    /// Multiplier on distance from mid-grey (1.0 = neutral)
    pub contrast: f32,
    /// Neck tilt in radians
    pub tilt: f32,
    /// Apparent size; >1 is closer to the camera
    pub zoom: f32,
    pub hand: bool,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            contrast: 1.0,
            tilt: 0.0,
            zoom: 1.0,
            hand: false,
        }
    }
}

/// Scene shared between the frame generator and the simulated detector.
#[derive(Clone, Default)]
pub struct SceneHandle(Arc<Mutex<Scene>>);

impl SceneHandle {
    pub fn get(&self) -> Scene {
        self.0.lock().map(|s| *s).unwrap_or_else(|p| *p.into_inner())
    }

    pub fn update(&self, f: impl FnOnce(&mut Scene)) {
        match self.0.lock() {
            Ok(mut s) => f(&mut s),
            Err(p) => f(&mut p.into_inner()),
        }
    }
}

// ─── Geometry ───────────────────────────────────────────────────────────────

/// x of fret wire `n` (0 = nut), equal-tempered spacing.
fn fret_x(n: u32, zoom: f32) -> f32 {
    NUT_X + SCALE_LENGTH * zoom * (1.0 - 2f32.powf(-(n as f32) / 12.0))
}

fn neck_centre_y(x: f32, scene: &Scene, width: u32, height: u32) -> f32 {
    height as f32 / 2.0 + scene.tilt.tan() * (x - width as f32 / 2.0)
}

/// Outline of each visible zone: (fret number, corners clockwise from
/// top-left). Zones running off the right edge are left out.
pub fn zone_polygons(scene: &Scene, width: u32, height: u32) -> Vec<(u32, [Point; 4])> {
    let half = NECK_HEIGHT * scene.zoom / 2.0;
    (1..=VISIBLE_FRETS)
        .filter_map(|fret| {
            let x0 = fret_x(fret - 1, scene.zoom);
            let x1 = fret_x(fret, scene.zoom);
            if x1 > width as f32 {
                return None;
            }
            let y0 = neck_centre_y(x0, scene, width, height);
            let y1 = neck_centre_y(x1, scene, width, height);
            Some((
                fret,
                [
                    Point::new(x0, y0 - half),
                    Point::new(x1, y1 - half),
                    Point::new(x1, y1 + half),
                    Point::new(x0, y0 + half),
                ],
            ))
        })
        .collect()
}

/// Draw the neck (wood, fret wires, six strings) and apply scene lighting.
pub fn render_scene(scene: &Scene, width: u32, height: u32) -> RgbaImage {
    let background = [40.0f32, 40.0, 45.0];
    let wood = [140.0f32, 90.0, 50.0];
    let wire = [205.0f32, 205.0, 200.0];
    let string = [225.0f32, 215.0, 180.0];

    let half = NECK_HEIGHT * scene.zoom / 2.0;
    let wires: Vec<f32> = (0..=VISIBLE_FRETS).map(|n| fret_x(n, scene.zoom)).collect();
    let neck_end = wires.last().copied().unwrap_or(NUT_X);

    let mut img = RgbaImage::new(width, height);
    for (x, y, px) in img.enumerate_pixels_mut() {
        let (xf, yf) = (x as f32, y as f32);
        let dy = yf - neck_centre_y(xf, scene, width, height);
        let on_neck = xf >= NUT_X && xf <= neck_end && dy.abs() <= half;
        let base = if !on_neck {
            background
        } else if wires.iter().any(|w| (xf - w).abs() < 1.5) {
            wire
        } else if (0..NUM_STRINGS).any(|s| {
            let sy = -half + s as f32 * 2.0 * half / (NUM_STRINGS - 1) as f32;
            (dy - sy).abs() < 1.0
        }) {
            string
        } else {
            wood
        };
        let lit = base.map(|v| {
            let v = ((v - 128.0) * scene.contrast + 128.0) * scene.exposure;
            v.round().clamp(0.0, 255.0) as u8
        });
        *px = Rgba([lit[0], lit[1], lit[2], 255]);
    }
    img
}

// ─── Simulated detector ─────────────────────────────────────────────────────

/// Returns the scene's zone outlines with a confidence that falls off as the
/// frame's exposure and contrast drift from a neutral render. Filters that
/// undo bad lighting therefore raise confidence, which gives calibration a
/// real signal.
pub struct SimulatedDetector {
    scene: SceneHandle,
    width: u32,
    height: u32,
    reference_mean: f32,
    reference_std: f32,
}

impl SimulatedDetector {
    pub fn new(scene: SceneHandle, width: u32, height: u32) -> Self {
        let neutral = render_scene(&Scene::default(), width, height);
        let (reference_mean, reference_std) = luma_stats(&neutral);
        Self {
            scene,
            width,
            height,
            reference_mean,
            reference_std: reference_std.max(1.0),
        }
    }

    /// Confidence for an image with the given luma statistics.
    pub fn quality(&self, mean: f32, std: f32) -> f32 {
        let exposure = (1.0 - (mean - self.reference_mean).abs() / 128.0).clamp(0.0, 1.0);
        let contrast = (std / self.reference_std).min(1.0);
        0.97 * exposure * contrast
    }
}

impl Detector for SimulatedDetector {
    fn infer(&mut self, image: &RgbaImage) -> Result<Vec<Detection>, InferenceError> {
        if image.dimensions() != (self.width, self.height) {
            return Err(InferenceError::Backend(format!(
                "expected {}x{} frame, got {:?}",
                self.width,
                self.height,
                image.dimensions()
            )));
        }
        let (mean, std) = luma_stats(image);
        let quality = self.quality(mean, std);
        let scene = self.scene.get();

        let mut detections: Vec<Detection> = zone_polygons(&scene, self.width, self.height)
            .into_iter()
            .filter_map(|(fret, corners)| {
                let confidence = (quality - 0.02 * (fret % 3) as f32).clamp(0.0, 0.99);
                (confidence >= 0.05).then(|| {
                    Detection::polygon(&format!("{}{}", ZONE_PREFIX, fret), confidence, corners.to_vec())
                })
            })
            .collect();

        if scene.hand {
            let x = fret_x(2, scene.zoom);
            let y = neck_centre_y(x, &scene, self.width, self.height) - 20.0;
            detections.push(Detection::bbox(
                HAND_LABEL,
                0.95,
                BBox { x, y, width: 90.0, height: 110.0 },
            ));
        }
        Ok(detections)
    }
}

// ─── Frame generator ────────────────────────────────────────────────────────

/// Generates synthetic camera frames under scripted lighting and camera
/// gestures, paced at `fps`.
pub struct Simulator {
    clock: SessionClock,
    tx: Sender<FrameEvent>,
    scene: SceneHandle,
    fps: u32,
    width: u32,
    height: u32,
    frame_limit: Option<u64>,
    frames_sent: u64,
}

impl Simulator {
    pub fn new(clock: SessionClock, tx: Sender<FrameEvent>, fps: u32) -> Self {
        Self {
            clock,
            tx,
            scene: SceneHandle::default(),
            fps: fps.max(1),
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            frame_limit: None,
            frames_sent: 0,
        }
    }

    /// Stop after `n` frames instead of holding forever.
    pub fn with_frame_limit(mut self, n: u64) -> Self {
        self.frame_limit = Some(n);
        self
    }

    pub fn scene(&self) -> SceneHandle {
        self.scene.clone()
    }

    /// A detector that sees this simulator's scene.
    pub fn detector(&self) -> SimulatedDetector {
        SimulatedDetector::new(self.scene.clone(), self.width, self.height)
    }

    /// Run the demo sequence, then hold the final scene. Returns when the
    /// frame limit is reached or the receiver hangs up.
    pub fn run(&mut self) -> u64 {
        info!("Simulator starting demo sequence at {} fps...", self.fps);
        for gesture in &demo_sequence() {
            if !self.execute(gesture) {
                return self.finish();
            }
        }
        info!("Demo sequence complete. Holding final scene...");
        while self.emit_frame() {}
        self.finish()
    }

    fn finish(&self) -> u64 {
        info!("Simulator stopped after {} frames", self.frames_sent);
        self.frames_sent
    }

    fn frames_for(&self, ms: u32) -> u64 {
        (ms as u64 * self.fps as u64 / 1000).max(1)
    }

    /// Ramp one scene parameter with ease in/out. Returns false to stop.
    fn ramp(&mut self, ms: u32, to: f32, field: fn(&mut Scene) -> &mut f32) -> bool {
        let from = {
            let mut s = self.scene.get();
            *field(&mut s)
        };
        let frames = self.frames_for(ms);
        for i in 0..frames {
            let t = (i + 1) as f32 / frames as f32;
            self.scene.update(|s| *field(s) = lerp(from, to, smoothstep(t)));
            if !self.emit_frame() {
                return false;
            }
        }
        true
    }

    fn execute(&mut self, gesture: &Gesture) -> bool {
        match *gesture {
            Gesture::Hold { ms } => {
                info!("  hold {}ms", ms);
                (0..self.frames_for(ms)).all(|_| self.emit_frame())
            }
            Gesture::Exposure { to, ms } => {
                info!("  exposure → {:.2} over {}ms", to, ms);
                self.ramp(ms, to, |s| &mut s.exposure)
            }
            Gesture::Contrast { to, ms } => {
                info!("  contrast → {:.2} over {}ms", to, ms);
                self.ramp(ms, to, |s| &mut s.contrast)
            }
            Gesture::Tilt { to, ms } => {
                info!("  tilt → {:.1}° over {}ms", to.to_degrees(), ms);
                self.ramp(ms, to, |s| &mut s.tilt)
            }
            Gesture::Zoom { to, ms } => {
                info!("  zoom → {:.2} over {}ms", to, ms);
                self.ramp(ms, to, |s| &mut s.zoom)
            }
            Gesture::HandOn => {
                info!("  hand enters frame");
                self.scene.update(|s| s.hand = true);
                true
            }
            Gesture::HandOff => {
                info!("  hand leaves frame");
                self.scene.update(|s| s.hand = false);
                true
            }
        }
    }

    /// Render and send one frame, then sleep one frame period.
    fn emit_frame(&mut self) -> bool {
        if self.frame_limit.is_some_and(|limit| self.frames_sent >= limit) {
            return false;
        }
        let scene = self.scene.get();
        let frame = CapturedFrame {
            timestamp_ms: self.clock.now_ms(),
            captured_at: Instant::now(),
            image: render_scene(&scene, self.width, self.height),
        };
        if self.tx.send(FrameEvent::Frame(frame)).is_err() {
            debug!("Frame receiver closed");
            return false;
        }
        self.frames_sent += 1;
        thread::sleep(Duration::from_millis(1000 / self.fps as u64));
        true
    }
}

// ─── Gesture types ──────────────────────────────────────────────────────────

enum Gesture {
    Hold { ms: u32 },
    Exposure { to: f32, ms: u32 },
    Contrast { to: f32, ms: u32 },
    Tilt { to: f32, ms: u32 },
    Zoom { to: f32, ms: u32 },
    HandOn,
    HandOff,
}

/// Roughly 15 seconds: the room dims, the camera tilts and moves closer, a
/// hand covers the low frets, contrast washes out, then everything recovers.
fn demo_sequence() -> Vec<Gesture> {
    vec![
        Gesture::Hold { ms: 1000 },
        // Lights dim: detector confidence drops, calibration can compensate
        Gesture::Exposure { to: 0.55, ms: 1500 },
        Gesture::Hold { ms: 2000 },
        Gesture::Tilt { to: 0.12, ms: 1000 },
        Gesture::Zoom { to: 1.15, ms: 1000 },
        Gesture::HandOn,
        Gesture::Hold { ms: 1500 },
        Gesture::HandOff,
        Gesture::Contrast { to: 0.6, ms: 1000 },
        Gesture::Hold { ms: 1000 },
        Gesture::Contrast { to: 1.0, ms: 800 },
        Gesture::Exposure { to: 1.0, ms: 800 },
        Gesture::Tilt { to: 0.0, ms: 600 },
        Gesture::Zoom { to: 1.0, ms: 600 },
        Gesture::Hold { ms: 1000 },
    ]
}

// ─── Math helpers ───────────────────────────────────────────────────────────

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Smooth interpolation (ease in/out)
fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fret_tracker::{FretTracker, TrackerConfig};
    use crossbeam_channel::bounded;

    #[test]
    fn test_zone_layout_passes_tracker() {
        let scene = Scene::default();
        let zones = zone_polygons(&scene, FRAME_WIDTH, FRAME_HEIGHT);
        assert_eq!(zones.len(), VISIBLE_FRETS as usize);
        let dets: Vec<Detection> = zones
            .iter()
            .map(|(f, c)| Detection::polygon(&format!("Zone{}", f), 0.9, c.to_vec()))
            .collect();
        let mut tracker = FretTracker::new(TrackerConfig::default());
        tracker.update(&dets, FRAME_HEIGHT as f32);
        let frets: Vec<u32> = tracker.stable_frets().iter().map(|z| z.fret_number).collect();
        assert_eq!(frets, (1..=VISIBLE_FRETS).collect::<Vec<_>>());
    }

    #[test]
    fn test_dim_scene_lowers_confidence() {
        let handle = SceneHandle::default();
        let mut det = SimulatedDetector::new(handle.clone(), 160, 120);
        let bright = det.infer(&render_scene(&Scene::default(), 160, 120)).unwrap();
        let dim_scene = Scene { exposure: 0.5, ..Scene::default() };
        let dim = det.infer(&render_scene(&dim_scene, 160, 120)).unwrap();
        let avg = |d: &[Detection]| d.iter().map(|x| x.confidence).sum::<f32>() / d.len().max(1) as f32;
        assert!(avg(&bright) > 0.9, "neutral scene should score high: {}", avg(&bright));
        assert!(avg(&dim) < avg(&bright));
    }

    #[test]
    fn test_hand_detection_and_size_check() {
        let handle = SceneHandle::default();
        handle.update(|s| s.hand = true);
        let mut det = SimulatedDetector::new(handle, 160, 120);
        let dets = det.infer(&render_scene(&Scene::default(), 160, 120)).unwrap();
        assert!(dets.iter().any(|d| d.is_hand()));
        assert!(det.infer(&RgbaImage::new(10, 10)).is_err());
    }

    #[test]
    fn test_simulator_respects_frame_limit() {
        let (tx, rx) = bounded(64);
        let mut sim = Simulator::new(SessionClock::new(), tx, 1000).with_frame_limit(3);
        assert_eq!(sim.run(), 3);
        assert_eq!(rx.try_iter().count(), 3);
    }
}
