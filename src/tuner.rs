//! Pitch helpers for the tuner: the pitch detector itself is external and
//! hands us a frequency; these map it onto notes and guitar strings.

use crate::error::NoteError;
use crate::types::Note;

/// Lowest and highest MIDI notes we report: C0 and B7.
const MIDI_MIN: i32 = 12;
const MIDI_MAX: i32 = 107;

/// Convert MIDI note number (fractional) to Hz. A4 = MIDI 69 = 440 Hz.
pub fn midi_to_hz(midi: f64) -> f64 {
    440.0 * 2.0_f64.powf((midi - 69.0) / 12.0)
}

/// Convert Hz to MIDI note number (fractional).
pub fn hz_to_midi(hz: f64) -> f64 {
    69.0 + 12.0 * (hz / 440.0).log2()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchReading {
    pub note: Note,
    pub octave: i32,
    /// Equal-tempered frequency of the reported note
    pub reference_hz: f64,
}

/// Nearest equal-tempered note in C0..=B7.
pub fn freq_to_note(hz: f64) -> Result<PitchReading, NoteError> {
    if !(hz > 0.0) || !hz.is_finite() {
        return Err(NoteError::InvalidFrequency(hz));
    }
    let midi = (hz_to_midi(hz).round() as i32).clamp(MIDI_MIN, MIDI_MAX);
    Ok(PitchReading {
        note: Note::from_index(midi as usize),
        octave: midi / 12 - 1,
        reference_hz: midi_to_hz(midi as f64),
    })
}

/// Signed distance in cents from `reference_hz` to `hz`.
pub fn cents_off(hz: f64, reference_hz: f64) -> f64 {
    1200.0 * (hz / reference_hz).log2()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuitarString {
    pub name: &'static str,
    pub hz: f64,
}

/// Standard tuning open strings, low to high.
pub const GUITAR_STRINGS: [GuitarString; 6] = [
    GuitarString { name: "E2", hz: 82.41 },
    GuitarString { name: "A2", hz: 110.00 },
    GuitarString { name: "D3", hz: 146.83 },
    GuitarString { name: "G3", hz: 196.00 },
    GuitarString { name: "B3", hz: 246.94 },
    GuitarString { name: "E4", hz: 329.63 },
];

/// The open string whose pitch is closest to `hz` (linear distance).
pub fn closest_string(hz: f64) -> GuitarString {
    let mut best = GUITAR_STRINGS[0];
    for s in GUITAR_STRINGS.iter().skip(1) {
        if (s.hz - hz).abs() < (best.hz - hz).abs() {
            best = *s;
        }
    }
    best
}
