//! Fretboard note mapping: tuning, scale and chord tables.

use crate::error::NoteError;
use crate::types::{Note, NUM_STRINGS};
use log::{debug, warn};

/// Open-string tuning, index 0 = low (6th) string.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuning {
    pub name: String,
    pub open_strings: [Note; NUM_STRINGS],
}

impl Tuning {
    /// Pitch class sounding at `fret` on `string_index`.
    ///
    /// Errors on a string index outside `0..=5` or a negative fret; both are
    /// caller bugs, not detector noise.
    pub fn note_at(&self, string_index: usize, fret: i32) -> Result<Note, NoteError> {
        pitch_at(&self.open_strings, string_index, fret)
    }

    /// Notes for frets `0..=num_frets` on every string.
    pub fn fretboard_map(&self, num_frets: u32) -> [Vec<Note>; NUM_STRINGS] {
        self.open_strings.map(|open| (0..=num_frets as usize).map(|f| open.transpose(f)).collect())
    }

    /// Frets `0..=num_frets` on one string whose note is in `notes`.
    pub fn string_scale_positions(
        &self,
        string_index: usize,
        notes: &[Note],
        num_frets: u32,
    ) -> Result<Vec<u32>, NoteError> {
        if string_index >= NUM_STRINGS {
            return Err(NoteError::InvalidString(string_index));
        }
        let open = self.open_strings[string_index];
        Ok((0..=num_frets)
            .filter(|&f| notes.contains(&open.transpose(f as usize)))
            .collect())
    }
}

fn pitch_at(open_strings: &[Note; NUM_STRINGS], string_index: usize, fret: i32) -> Result<Note, NoteError> {
    let open = open_strings
        .get(string_index)
        .ok_or(NoteError::InvalidString(string_index))?;
    if fret < 0 {
        return Err(NoteError::InvalidFret(fret));
    }
    Ok(open.transpose(fret as usize))
}

/// E A D G B E, low string first.
pub const STANDARD_OPEN_STRINGS: [Note; NUM_STRINGS] =
    [Note::E, Note::A, Note::D, Note::G, Note::B, Note::E];

pub fn standard_tuning() -> Tuning {
    Tuning {
        name: "Standard".to_string(),
        open_strings: STANDARD_OPEN_STRINGS,
    }
}

/// `note_at` on standard tuning.
pub fn note_at(string_index: usize, fret: i32) -> Result<Note, NoteError> {
    pitch_at(&STANDARD_OPEN_STRINGS, string_index, fret)
}

// ─── Scales ─────────────────────────────────────────────────────────────────

/// Scale name → semitone intervals above the root.
pub const SCALES: [(&str, &[usize]); 10] = [
    ("major", &[0, 2, 4, 5, 7, 9, 11]),
    ("minor", &[0, 2, 3, 5, 7, 8, 10]),
    ("pentatonic_major", &[0, 2, 4, 7, 9]),
    ("pentatonic_minor", &[0, 3, 5, 7, 10]),
    ("blues", &[0, 3, 5, 6, 7, 10]),
    ("dorian", &[0, 2, 3, 5, 7, 9, 10]),
    ("mixolydian", &[0, 2, 4, 5, 7, 9, 10]),
    ("harmonic_minor", &[0, 2, 3, 5, 7, 8, 11]),
    ("melodic_minor", &[0, 2, 3, 5, 7, 9, 11]),
    ("phrygian", &[0, 1, 3, 5, 7, 8, 10]),
];

pub fn scale_intervals(scale_name: &str) -> Option<&'static [usize]> {
    SCALES
        .iter()
        .find(|(name, _)| *name == scale_name)
        .map(|(_, intervals)| *intervals)
}

/// Notes of `scale_name` rooted at `root`, in interval order.
/// An unknown scale yields no notes rather than an error.
pub fn scale_notes(root: Note, scale_name: &str) -> Vec<Note> {
    match scale_intervals(scale_name) {
        Some(intervals) => intervals.iter().map(|&i| root.transpose(i)).collect(),
        None => {
            debug!("unknown scale `{}`, no notes highlighted", scale_name);
            Vec::new()
        }
    }
}

/// Same as [`scale_notes`] for a root given as text. An unknown root also
/// yields no notes.
pub fn scale_notes_str(root: &str, scale_name: &str) -> Vec<Note> {
    match root.parse::<Note>() {
        Ok(root) => scale_notes(root, scale_name),
        Err(_) => Vec::new(),
    }
}

// ─── Chords ─────────────────────────────────────────────────────────────────

pub const CHORDS: [(&str, &[usize]); 7] = [
    ("major", &[0, 4, 7]),
    ("minor", &[0, 3, 7]),
    ("diminished", &[0, 3, 6]),
    ("augmented", &[0, 4, 8]),
    ("major7", &[0, 4, 7, 11]),
    ("minor7", &[0, 3, 7, 10]),
    ("dominant7", &[0, 4, 7, 10]),
];

/// Chord tones of `root` + `kind`. Unknown kinds fall back to a major triad.
pub fn chord_notes(root: Note, kind: &str) -> Vec<Note> {
    let intervals = CHORDS
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, iv)| *iv)
        .unwrap_or(CHORDS[0].1);
    intervals.iter().map(|&i| root.transpose(i)).collect()
}

// ─── Scale state ────────────────────────────────────────────────────────────

/// User-selected musical context. `notes` is recomputed whenever root or
/// scale changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleState {
    root: Note,
    scale_name: String,
    notes: Vec<Note>,
}

impl ScaleState {
    /// Returns None for an unknown scale name.
    pub fn new(root: Note, scale_name: &str) -> Option<Self> {
        scale_intervals(scale_name)?;
        Some(Self {
            root,
            scale_name: scale_name.to_string(),
            notes: scale_notes(root, scale_name),
        })
    }

    /// Switch root and scale. An unknown scale leaves the state untouched and
    /// returns false.
    pub fn set_scale(&mut self, root: Note, scale_name: &str) -> bool {
        if scale_intervals(scale_name).is_none() {
            warn!(
                "invalid scale `{}`; expected one of {:?}",
                scale_name,
                SCALES.iter().map(|(n, _)| *n).collect::<Vec<_>>()
            );
            return false;
        }
        self.root = root;
        self.scale_name = scale_name.to_string();
        self.notes = scale_notes(root, scale_name);
        debug!("scale set to {} {}: {:?}", root, scale_name, self.notes);
        true
    }

    pub fn root(&self) -> Note {
        self.root
    }

    pub fn scale_name(&self) -> &str {
        &self.scale_name
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn contains(&self, note: Note) -> bool {
        self.notes.contains(&note)
    }
}

impl Default for ScaleState {
    fn default() -> Self {
        Self {
            root: Note::C,
            scale_name: "major".to_string(),
            notes: scale_notes(Note::C, "major"),
        }
    }
}
