//! Overlay geometry: where each string/fret dot goes and how it is drawn.
//!
//! Zone centres give a least-squares tilt that every dot is rotated by, and
//! the mean zone height scales dot and label sizes with camera distance.

use crate::notes::{standard_tuning, ScaleState, Tuning};
use crate::types::{BBox, Detection, DetectionKind, DrawablePoint, FretZone, Note, NoteCategory, NUM_STRINGS};
use log::trace;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Detections must be strictly above this to be drawn
    pub min_confidence: f32,
    /// Zone height (px) at which sizes are 1:1
    pub reference_height: f32,
    pub min_scale: f32,
    pub max_scale: f32,
    pub highlight_radius: f32,
    pub root_radius: f32,
    pub arpeggio_radius: f32,
    pub scale_radius: f32,
    pub other_radius: f32,
    pub font_size: f32,
    /// Label offset from the dot centre, before scaling
    pub label_offset: (f32, f32),
    /// Play-along notes at fret 0 light up the fret-1 zone
    pub open_string_substitute: bool,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.8,
            reference_height: 60.0,
            min_scale: 0.5,
            max_scale: 1.5,
            highlight_radius: 7.0,
            root_radius: 6.0,
            arpeggio_radius: 5.5,
            scale_radius: 5.0,
            other_radius: 2.5,
            font_size: 9.0,
            label_offset: (7.0, 3.0),
            open_string_substitute: true,
        }
    }
}

/// A (string, fret) pair in tuning order (string 0 = low E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FretPosition {
    pub string_index: usize,
    pub fret: u32,
}

impl FretPosition {
    pub fn new(string_index: usize, fret: u32) -> Self {
        Self { string_index, fret }
    }
}

/// Externally driven positions to emphasise, e.g. the play-along step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HighlightState {
    pub highlighted: Vec<FretPosition>,
    pub arpeggio: Vec<FretPosition>,
}

/// Everything a drawing backend needs for one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlayFrame {
    pub timestamp_ms: u64,
    pub points: Vec<DrawablePoint>,
    /// Radians; positive tilts the fretboard clockwise in image coordinates
    pub angle: f32,
    pub scale_factor: f32,
    pub font_size: f32,
    pub zone_count: usize,
}

/// Least-squares slope of `y` over `x`, as an angle. 0 for fewer than two
/// points or no spread in x.
pub fn rotation_angle(centres: &[(f32, f32)]) -> f32 {
    if centres.len() < 2 {
        return 0.0;
    }
    let n = centres.len() as f32;
    let mean_x = centres.iter().map(|c| c.0).sum::<f32>() / n;
    let mean_y = centres.iter().map(|c| c.1).sum::<f32>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for &(x, y) in centres {
        num += (x - mean_x) * (y - mean_y);
        den += (x - mean_x) * (x - mean_x);
    }
    let slope = if den != 0.0 { num / den } else { 0.0 };
    slope.atan()
}

/// `avg_height / 60`, clamped to 0.5..=1.5.
pub fn distance_scale_factor(avg_height: f32) -> f32 {
    scale_for(avg_height, &OverlayConfig::default())
}

fn scale_for(avg_height: f32, config: &OverlayConfig) -> f32 {
    (avg_height / config.reference_height).clamp(config.min_scale, config.max_scale)
}

/// One drawable zone after label parsing.
#[derive(Debug, Clone, Copy)]
struct ZoneGeom {
    fret: u32,
    x_center: f32,
    y_center: f32,
    /// Unrotated string y positions, top to bottom
    string_ys: [f32; NUM_STRINGS],
}

pub struct OverlayRenderer {
    config: OverlayConfig,
    tuning: Tuning,
}

impl OverlayRenderer {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            tuning: standard_tuning(),
        }
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Precedence: Highlighted > Root > Arpeggio > InScale > Other.
    pub fn categorize(
        &self,
        note: Note,
        position: FretPosition,
        scale: &ScaleState,
        highlights: &HighlightState,
    ) -> NoteCategory {
        if self.matches_any(&highlights.highlighted, position) {
            NoteCategory::Highlighted
        } else if note == scale.root() {
            NoteCategory::Root
        } else if self.matches_any(&highlights.arpeggio, position) {
            NoteCategory::Arpeggio
        } else if scale.contains(note) {
            NoteCategory::InScale
        } else {
            NoteCategory::Other
        }
    }

    fn matches_any(&self, wanted: &[FretPosition], at: FretPosition) -> bool {
        wanted.iter().any(|w| {
            w.string_index == at.string_index
                && (w.fret == at.fret
                    || (self.config.open_string_substitute && w.fret == 0 && at.fret == 1))
        })
    }

    pub fn radius(&self, category: NoteCategory, scale_factor: f32) -> f32 {
        let base = match category {
            NoteCategory::Highlighted => self.config.highlight_radius,
            NoteCategory::Root => self.config.root_radius,
            NoteCategory::Arpeggio => self.config.arpeggio_radius,
            NoteCategory::InScale => self.config.scale_radius,
            NoteCategory::Other => self.config.other_radius,
        };
        base * scale_factor
    }

    /// Where the note name is drawn for `point`.
    pub fn label_position(&self, point: &DrawablePoint, scale_factor: f32) -> (f32, f32) {
        let (ox, oy) = self.config.label_offset;
        (point.x + ox * scale_factor, point.y + oy * scale_factor)
    }

    /// Overlay from raw detections: boxes above `min_confidence`, hands
    /// excluded. Fret numbers come from `Zone<n>`/`Fret<n>` labels, otherwise
    /// from the detection's position in the filtered list.
    pub fn render_detections(
        &self,
        detections: &[Detection],
        scale: &ScaleState,
        highlights: &HighlightState,
    ) -> OverlayFrame {
        let kept: Vec<(&Detection, BBox)> = detections
            .iter()
            .filter(|d| !d.is_hand() && d.confidence > self.config.min_confidence)
            .filter_map(|d| d.bounds().map(|b| (d, b)))
            .collect();

        let centres: Vec<(f32, f32)> = kept.iter().map(|(_, b)| (b.x, b.y)).collect();
        let avg_height = if kept.is_empty() {
            self.config.reference_height
        } else {
            kept.iter().map(|(_, b)| b.height).sum::<f32>() / kept.len() as f32
        };

        let mut zones = Vec::with_capacity(kept.len());
        for (i, (det, b)) in kept.iter().enumerate() {
            let fret = match det.kind() {
                DetectionKind::Zone(n) | DetectionKind::Fret(n) => n,
                _ => i as u32 + 1,
            };
            if fret < 1 {
                trace!("skipping {} at fret 0", det.label);
                continue;
            }
            let mut string_ys = [0.0f32; NUM_STRINGS];
            for (s, y) in string_ys.iter_mut().enumerate() {
                *y = b.y - b.height / 2.0 + s as f32 * b.height / (NUM_STRINGS - 1) as f32;
            }
            zones.push(ZoneGeom {
                fret,
                x_center: b.x,
                y_center: b.y,
                string_ys,
            });
        }
        self.render(&zones, &centres, avg_height, scale, highlights)
    }

    /// Overlay from the tracker's stable frets.
    pub fn render_frets(
        &self,
        frets: &[FretZone],
        scale: &ScaleState,
        highlights: &HighlightState,
    ) -> OverlayFrame {
        let centres: Vec<(f32, f32)> = frets.iter().map(|z| (z.x_center, z.y_center)).collect();
        let avg_height = if frets.is_empty() {
            self.config.reference_height
        } else {
            frets.iter().map(|z| z.height()).sum::<f32>() / frets.len() as f32
        };
        let zones: Vec<ZoneGeom> = frets
            .iter()
            .map(|z| ZoneGeom {
                fret: z.fret_number,
                x_center: z.x_center,
                y_center: z.y_center,
                string_ys: z.string_positions(),
            })
            .collect();
        self.render(&zones, &centres, avg_height, scale, highlights)
    }

    fn render(
        &self,
        zones: &[ZoneGeom],
        centres: &[(f32, f32)],
        avg_height: f32,
        scale: &ScaleState,
        highlights: &HighlightState,
    ) -> OverlayFrame {
        let angle = rotation_angle(centres);
        let scale_factor = scale_for(avg_height, &self.config);
        let points = self.compute_points(zones, scale, highlights, angle, scale_factor);
        OverlayFrame {
            timestamp_ms: 0,
            points,
            angle,
            scale_factor,
            font_size: self.config.font_size * scale_factor,
            zone_count: zones.len(),
        }
    }

    fn compute_points(
        &self,
        zones: &[ZoneGeom],
        scale: &ScaleState,
        highlights: &HighlightState,
        angle: f32,
        scale_factor: f32,
    ) -> Vec<DrawablePoint> {
        let (sin, cos) = angle.sin_cos();
        let mut points = Vec::with_capacity(zones.len() * NUM_STRINGS);
        for zone in zones {
            for (string_index, &y) in zone.string_ys.iter().enumerate() {
                // Index is always < NUM_STRINGS, so the lookup cannot fail.
                let Ok(note) = self.tuning.note_at(string_index, zone.fret as i32) else {
                    continue;
                };
                let position = FretPosition::new(string_index, zone.fret);
                let category = self.categorize(note, position, scale, highlights);
                let dy = y - zone.y_center;
                points.push(DrawablePoint {
                    x: zone.x_center - dy * sin,
                    y: zone.y_center + dy * cos,
                    note,
                    category,
                    string_index,
                    fret_number: zone.fret,
                    radius: self.radius(category, scale_factor),
                });
            }
        }
        points
    }
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::new(OverlayConfig::default())
    }
}
