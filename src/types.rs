use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

// ─── Pitch classes ──────────────────────────────────────────────────────────

/// One of the 12 pitch classes, sharps only.
/// Serializes as its symbol ("C#") to match the scale tables and UI state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Note {
    C,
    #[serde(rename = "C#")]
    CSharp,
    D,
    #[serde(rename = "D#")]
    DSharp,
    E,
    F,
    #[serde(rename = "F#")]
    FSharp,
    G,
    #[serde(rename = "G#")]
    GSharp,
    A,
    #[serde(rename = "A#")]
    ASharp,
    B,
}

impl Note {
    /// Chromatic order starting at C.
    pub const ALL: [Note; 12] = [
        Note::C,
        Note::CSharp,
        Note::D,
        Note::DSharp,
        Note::E,
        Note::F,
        Note::FSharp,
        Note::G,
        Note::GSharp,
        Note::A,
        Note::ASharp,
        Note::B,
    ];

    /// Semitones above C (0..12).
    pub fn index(self) -> usize {
        self as usize
    }

    /// Pitch class `index mod 12` semitones above C.
    pub fn from_index(index: usize) -> Note {
        Note::ALL[index % 12]
    }

    /// Transpose up by `semitones`, wrapping at the octave.
    pub fn transpose(self, semitones: usize) -> Note {
        Note::from_index(self.index() + semitones)
    }

    pub fn symbol(self) -> &'static str {
        NOTE_SYMBOLS[self.index()]
    }
}

const NOTE_SYMBOLS: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.symbol())
    }
}

impl FromStr for Note {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NOTE_SYMBOLS
            .iter()
            .position(|&sym| sym == s.trim())
            .map(Note::from_index)
            .ok_or_else(|| format!("unknown note `{}`", s))
    }
}

// ─── Detections (external input, per frame) ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned box given by its centre and size (the detector's convention).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    /// Corners clockwise from top-left.
    pub fn corners(&self) -> [Point; 4] {
        let (hw, hh) = (self.width / 2.0, self.height / 2.0);
        [
            Point::new(self.x - hw, self.y - hh),
            Point::new(self.x + hw, self.y - hh),
            Point::new(self.x + hw, self.y + hh),
            Point::new(self.x - hw, self.y + hh),
        ]
    }
}

/// Geometry of a detection. Sources disagree on whether they send a polygon
/// or a box; both are normalized into this variant at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Shape {
    Polygon { points: Vec<Point> },
    BBox { bbox: BBox },
}

/// What a detector label denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionKind {
    Hand,
    /// `Zone<n>`: the region between two frets, numbered from the nut.
    Zone(u32),
    /// `Fret<n>`: older models label fret wires instead of zones.
    Fret(u32),
    Other,
}

pub const HAND_LABEL: &str = "Hand";
pub const ZONE_PREFIX: &str = "Zone";
pub const FRET_PREFIX: &str = "Fret";

/// One detection from the inference service. Produced fresh every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub shape: Shape,
}

impl Detection {
    pub fn polygon(label: &str, confidence: f32, points: Vec<Point>) -> Self {
        Self {
            label: label.to_string(),
            confidence,
            shape: Shape::Polygon { points },
        }
    }

    pub fn bbox(label: &str, confidence: f32, bbox: BBox) -> Self {
        Self {
            label: label.to_string(),
            confidence,
            shape: Shape::BBox { bbox },
        }
    }

    pub fn kind(&self) -> DetectionKind {
        if self.label == HAND_LABEL {
            return DetectionKind::Hand;
        }
        if let Some(rest) = self.label.strip_prefix(ZONE_PREFIX) {
            return rest
                .parse()
                .map(DetectionKind::Zone)
                .unwrap_or(DetectionKind::Other);
        }
        if let Some(rest) = self.label.strip_prefix(FRET_PREFIX) {
            return rest
                .parse()
                .map(DetectionKind::Fret)
                .unwrap_or(DetectionKind::Other);
        }
        DetectionKind::Other
    }

    pub fn is_hand(&self) -> bool {
        self.kind() == DetectionKind::Hand
    }

    /// Outline points. A box becomes its 4 corners.
    pub fn outline(&self) -> Vec<Point> {
        match &self.shape {
            Shape::Polygon { points } => points.clone(),
            Shape::BBox { bbox } => bbox.corners().to_vec(),
        }
    }

    /// Bounding box of the outline (centre + size). None for an empty polygon.
    pub fn bounds(&self) -> Option<BBox> {
        match &self.shape {
            Shape::BBox { bbox } => Some(*bbox),
            Shape::Polygon { points } => {
                let first = points.first()?;
                let (mut x0, mut x1, mut y0, mut y1) = (first.x, first.x, first.y, first.y);
                for p in points {
                    x0 = x0.min(p.x);
                    x1 = x1.max(p.x);
                    y0 = y0.min(p.y);
                    y1 = y1.max(p.y);
                }
                Some(BBox {
                    x: (x0 + x1) / 2.0,
                    y: (y0 + y1) / 2.0,
                    width: x1 - x0,
                    height: y1 - y0,
                })
            }
        }
    }
}

// ─── Fret zones (derived) ───────────────────────────────────────────────────

pub const NUM_STRINGS: usize = 6;

/// A validated fret zone produced by the tracker for one update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FretZone {
    pub fret_number: u32,
    pub x_center: f32,
    pub y_center: f32,
    pub y_min: f32,
    pub y_max: f32,
    pub width: f32,
    pub confidence: f32,
}

impl FretZone {
    /// Six evenly spaced string y-positions across the zone's vertical
    /// extent, top to bottom, rounded to whole pixels.
    pub fn string_positions(&self) -> [f32; NUM_STRINGS] {
        let span = self.y_max - self.y_min;
        let mut ys = [0.0f32; NUM_STRINGS];
        for (i, y) in ys.iter_mut().enumerate() {
            *y = (self.y_min + i as f32 * span / (NUM_STRINGS - 1) as f32).round();
        }
        ys
    }

    pub fn height(&self) -> f32 {
        self.y_max - self.y_min
    }
}

// ─── Filter chains (calibration artifact) ───────────────────────────────────

/// A filter parameter: numeric (brightness offset, gamma) or an on/off flag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterParam {
    Flag(bool),
    Number(f64),
}

impl fmt::Display for FilterParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterParam::Flag(b) => write!(f, "{}", b),
            FilterParam::Number(n) => write!(f, "{}", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterStep {
    pub filter: String,
    pub param: FilterParam,
}

impl FilterStep {
    pub fn new(filter: &str, param: FilterParam) -> Self {
        Self {
            filter: filter.to_string(),
            param,
        }
    }
}

/// Ordered preprocessing steps; later steps see the output of earlier ones.
pub type FilterChain = Vec<FilterStep>;

/// Human-readable chain, e.g. `brightness(30) → contrast(-30)`.
pub fn describe_chain(chain: &[FilterStep]) -> String {
    if chain.is_empty() {
        return "none".to_string();
    }
    chain
        .iter()
        .map(|s| format!("{}({})", s.filter, s.param))
        .collect::<Vec<_>>()
        .join(" → ")
}

/// Outcome of one calibration run. Immutable; a new run supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationResult {
    pub baseline_confidence: f32,
    pub filter_chain: FilterChain,
    pub achieved_confidence: f32,
}

// ─── Overlay output ─────────────────────────────────────────────────────────

/// How a fretboard position is drawn. Declared in precedence order,
/// highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteCategory {
    Highlighted,
    Root,
    Arpeggio,
    InScale,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawablePoint {
    pub x: f32,
    pub y: f32,
    pub note: Note,
    pub category: NoteCategory,
    pub string_index: usize,
    pub fret_number: u32,
    /// Dot radius in pixels, already distance-scaled.
    pub radius: f32,
}

// ─── Frames ─────────────────────────────────────────────────────────────────

/// A captured video frame entering the pipeline.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Milliseconds since session start
    pub timestamp_ms: u64,
    pub captured_at: Instant,
    pub image: RgbaImage,
}

/// Raw detections for one frame, as recorded to and replayed from sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionFrame {
    pub t: u64,
    pub frame_height: f32,
    pub detections: Vec<Detection>,
}

// ─── Session clock ──────────────────────────────────────────────────────────

/// Monotonic clock for the capture session.
#[derive(Clone)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn start(&self) -> Instant {
        self.start
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}
