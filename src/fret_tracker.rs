use crate::types::*;
use log::trace;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Tracker tuning. Defaults match a 12-fret zone model at 640-900px wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Highest zone number accepted (zones are numbered from 1)
    pub num_frets: u32,
    /// Detections below this confidence are dropped
    pub stability_threshold: f32,
    /// Minimum polygon width in pixels
    pub min_fret_width: f32,
    /// Allowed horizontal distance between neighbouring kept zones
    pub min_fret_spacing: f32,
    pub max_fret_spacing: f32,
    /// Updates arriving sooner than this after the last accepted one are ignored
    pub update_interval_ms: u64,
    /// Optional exponential smoothing across updates, keyed by fret number.
    /// Weight of the previous value, 0.0..1.0. None keeps every update
    /// independent of the previous one.
    pub smoothing: Option<f32>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            num_frets: 12,
            stability_threshold: 0.3,
            min_fret_width: 20.0,
            min_fret_spacing: 40.0,
            max_fret_spacing: 120.0,
            update_interval_ms: 33, // ~30fps
            smoothing: None,
        }
    }
}

/// Turns raw per-frame detections into a sorted, spacing-validated list of
/// fret zones.
///
/// Each accepted update replaces the stable list wholesale. Noise from the
/// detector (hand boxes, foreign labels, low confidence, degenerate polygons,
/// zones too close or too far from their neighbour) is dropped silently.
pub struct FretTracker {
    config: TrackerConfig,
    /// Sorted ascending by `x_center`
    stable: Vec<FretZone>,
    last_update: Option<Instant>,
    frame_height: f32,
    /// Previous smoothed zone per fret number (only with smoothing on)
    history: Vec<FretZone>,
}

impl FretTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            stable: Vec::new(),
            last_update: None,
            frame_height: 0.0,
            history: Vec::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Ingest one frame of detections, rate-limited against the wall clock.
    /// Returns false if the call was throttled.
    pub fn update(&mut self, detections: &[Detection], frame_height: f32) -> bool {
        self.update_at(detections, frame_height, Instant::now())
    }

    /// Same as [`update`](Self::update) with an explicit "now".
    pub fn update_at(&mut self, detections: &[Detection], frame_height: f32, now: Instant) -> bool {
        if let Some(last) = self.last_update {
            let interval = Duration::from_millis(self.config.update_interval_ms);
            if now.saturating_duration_since(last) < interval {
                return false;
            }
        }
        self.last_update = Some(now);
        self.frame_height = frame_height;

        // ── 1. Per-detection filtering and geometry ───────────────────
        let mut zones: Vec<FretZone> = Vec::with_capacity(detections.len());
        for det in detections {
            let Some(zone) = self.zone_from_detection(det) else {
                continue;
            };
            // Rounded x is the identity within one update; a later
            // detection at the same x replaces the earlier one.
            match zones.binary_search_by(|z| z.x_center.total_cmp(&zone.x_center)) {
                Ok(idx) => {
                    trace!("zone collision at x={}, keeping later detection", zone.x_center);
                    zones[idx] = zone;
                }
                Err(idx) => zones.insert(idx, zone),
            }
        }

        // ── 2. Optional smoothing ─────────────────────────────────────
        if let Some(weight) = self.config.smoothing {
            zones = self.smooth(zones, weight.clamp(0.0, 1.0));
        }

        // ── 3. Spacing validation against the previous kept zone ─────
        let mut kept: Vec<FretZone> = Vec::with_capacity(zones.len());
        for zone in zones {
            if let Some(prev) = kept.last() {
                let spacing = zone.x_center - prev.x_center;
                if spacing < self.config.min_fret_spacing || spacing > self.config.max_fret_spacing {
                    trace!(
                        "reject fret {} at x={}: spacing {} outside [{}, {}]",
                        zone.fret_number,
                        zone.x_center,
                        spacing,
                        self.config.min_fret_spacing,
                        self.config.max_fret_spacing
                    );
                    continue;
                }
            }
            kept.push(zone);
        }

        self.stable = kept;
        true
    }

    /// Apply the class, range, confidence and shape rules to one detection.
    fn zone_from_detection(&self, det: &Detection) -> Option<FretZone> {
        let fret_number = match det.kind() {
            DetectionKind::Zone(n) => n,
            _ => return None,
        };
        if fret_number < 1 || fret_number > self.config.num_frets {
            return None;
        }
        if det.confidence < self.config.stability_threshold {
            return None;
        }
        let points = det.outline();
        if points.len() < 3 {
            return None;
        }

        let n = points.len() as f32;
        let x_center = (points.iter().map(|p| p.x).sum::<f32>() / n).round();
        let y_center = (points.iter().map(|p| p.y).sum::<f32>() / n).round();
        let (mut x_min, mut x_max) = (f32::INFINITY, f32::NEG_INFINITY);
        let (mut y_min, mut y_max) = (f32::INFINITY, f32::NEG_INFINITY);
        for p in &points {
            x_min = x_min.min(p.x);
            x_max = x_max.max(p.x);
            y_min = y_min.min(p.y);
            y_max = y_max.max(p.y);
        }
        let width = x_max - x_min;
        if width < self.config.min_fret_width {
            return None;
        }

        Some(FretZone {
            fret_number,
            x_center,
            y_center,
            y_min,
            y_max,
            width,
            confidence: det.confidence,
        })
    }

    fn smooth(&mut self, zones: Vec<FretZone>, weight: f32) -> Vec<FretZone> {
        let alpha = 1.0 - weight;
        let blend = |prev: f32, cur: f32| prev + alpha * (cur - prev);
        let mut out: Vec<FretZone> = zones
            .into_iter()
            .map(|z| match self.history.iter().find(|h| h.fret_number == z.fret_number) {
                Some(prev) => FretZone {
                    fret_number: z.fret_number,
                    x_center: blend(prev.x_center, z.x_center).round(),
                    y_center: blend(prev.y_center, z.y_center).round(),
                    y_min: blend(prev.y_min, z.y_min),
                    y_max: blend(prev.y_max, z.y_max),
                    width: blend(prev.width, z.width),
                    confidence: blend(prev.confidence, z.confidence),
                },
                None => z,
            })
            .collect();
        out.sort_by(|a, b| a.x_center.total_cmp(&b.x_center));
        // Frets missing from this update lose their history. Zones the
        // spacing walk rejects keep theirs, so they can converge back.
        self.history = out.clone();
        out
    }

    /// Current stable list, sorted ascending by `x_center`.
    pub fn stable_frets(&self) -> &[FretZone] {
        &self.stable
    }

    /// Zone whose centre is closest to `x`.
    pub fn nearest_zone(&self, x: f32) -> Option<&FretZone> {
        let idx = match self.stable.binary_search_by(|z| z.x_center.total_cmp(&x)) {
            Ok(i) => return self.stable.get(i),
            Err(i) => i,
        };
        let left = idx.checked_sub(1).and_then(|i| self.stable.get(i));
        let right = self.stable.get(idx);
        match (left, right) {
            (Some(l), Some(r)) => {
                if (x - l.x_center) <= (r.x_center - x) {
                    Some(l)
                } else {
                    Some(r)
                }
            }
            (l, r) => l.or(r),
        }
    }

    /// Height of the last accepted frame.
    pub fn frame_height(&self) -> f32 {
        self.frame_height
    }

    pub fn reset(&mut self) {
        self.stable.clear();
        self.history.clear();
        self.last_update = None;
    }
}

impl Default for FretTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

/// Six string y-positions for a zone (see [`FretZone::string_positions`]).
pub fn string_positions(zone: &FretZone) -> [f32; NUM_STRINGS] {
    zone.string_positions()
}
