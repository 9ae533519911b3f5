//! Play-along: arpeggio presets stepped on a timer, ASCII tab parsing and
//! timing grades.

use crate::notes::note_at;
use crate::overlay::{FretPosition, HighlightState};
use crate::types::{Note, NUM_STRINGS};
use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const DEFAULT_STEP_MS: u64 = 1200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArpeggioStep {
    pub position: FretPosition,
    pub note: Note,
    pub is_root: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arpeggio {
    pub name: String,
    pub steps: Vec<ArpeggioStep>,
}

impl Arpeggio {
    /// Steps from (string, fret, is_root) triples; notes come from the tuning.
    pub fn from_positions(name: &str, positions: &[(usize, u32, bool)]) -> Self {
        let steps = positions
            .iter()
            .filter_map(|&(string_index, fret, is_root)| {
                let note = note_at(string_index, fret as i32).ok()?;
                Some(ArpeggioStep {
                    position: FretPosition::new(string_index, fret),
                    note,
                    is_root,
                })
            })
            .collect();
        Self {
            name: name.to_string(),
            steps,
        }
    }

    pub fn positions(&self) -> Vec<FretPosition> {
        self.steps.iter().map(|s| s.position).collect()
    }
}

/// Built-in triads, string 0 = low E.
pub fn presets() -> Vec<Arpeggio> {
    vec![
        Arpeggio::from_positions("C Major Triad", &[(1, 3, true), (2, 2, false), (3, 0, false)]),
        Arpeggio::from_positions("D Major Triad", &[(2, 0, true), (3, 2, false), (5, 2, false)]),
        Arpeggio::from_positions("G Major Triad", &[(1, 2, false), (2, 0, false), (3, 0, true)]),
    ]
}

pub fn preset(name: &str) -> Option<Arpeggio> {
    presets().into_iter().find(|a| a.name.eq_ignore_ascii_case(name))
}

// ─── Stepper ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Playing { step: usize, started_ms: u64 },
    Done,
}

/// Walks an arpeggio one step per `step_ms`, then stops on its own.
pub struct PlayAlong {
    arpeggio: Arpeggio,
    step_ms: u64,
    state: PlayState,
}

impl PlayAlong {
    pub fn new(arpeggio: Arpeggio) -> Self {
        Self {
            arpeggio,
            step_ms: DEFAULT_STEP_MS,
            state: PlayState::Stopped,
        }
    }

    pub fn with_step_ms(mut self, step_ms: u64) -> Self {
        self.step_ms = step_ms.max(1);
        self
    }

    pub fn arpeggio(&self) -> &Arpeggio {
        &self.arpeggio
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn start(&mut self, now_ms: u64) {
        info!("Play-along: {} ({} steps)", self.arpeggio.name, self.arpeggio.steps.len());
        self.state = if self.arpeggio.steps.is_empty() {
            PlayState::Done
        } else {
            PlayState::Playing {
                step: 0,
                started_ms: now_ms,
            }
        };
    }

    pub fn stop(&mut self) {
        self.state = PlayState::Stopped;
    }

    /// Advance to the step due at `now_ms`. Returns the new step index when
    /// it changed.
    pub fn tick(&mut self, now_ms: u64) -> Option<usize> {
        let PlayState::Playing { step, started_ms } = self.state else {
            return None;
        };
        let due = (now_ms.saturating_sub(started_ms) / self.step_ms) as usize;
        if due >= self.arpeggio.steps.len() {
            debug!("Play-along finished");
            self.state = PlayState::Done;
            return None;
        }
        if due == step {
            return None;
        }
        self.state = PlayState::Playing {
            step: due,
            started_ms,
        };
        Some(due)
    }

    pub fn current_step(&self) -> Option<&ArpeggioStep> {
        match self.state {
            PlayState::Playing { step, .. } => self.arpeggio.steps.get(step),
            _ => None,
        }
    }

    /// Current step highlighted while playing; every step marked as arpeggio.
    pub fn highlight_state(&self) -> HighlightState {
        HighlightState {
            highlighted: self.current_step().map(|s| vec![s.position]).unwrap_or_default(),
            arpeggio: self.arpeggio.positions(),
        }
    }
}

// ─── Tabs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabNote {
    pub string_index: usize,
    pub fret: u32,
    /// Character column of the first digit, for ordering in time
    pub column: usize,
}

/// Tab row name → string index, low E = 0. Tabs usually print the high e
/// row on top; row order in the text does not matter.
fn tab_row_string(name: &str) -> Option<usize> {
    const ROWS: [&str; NUM_STRINGS] = ["E", "A", "D", "G", "B", "e"];
    ROWS.iter().position(|&r| r == name)
}

// Both patterns are constant literals; compiling them cannot fail at runtime.
fn tab_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([eBGDAE])\s*[|:](.*)$").expect("tab row pattern"))
}

fn digits_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9]+").expect("digits pattern"))
}

/// Parse ASCII tab (`e|--0--2--|` per string) into notes ordered by column,
/// low string first within a column. Lines that are not string rows are
/// ignored; multi-digit frets are read whole.
pub fn parse_tab(text: &str) -> Vec<TabNote> {
    let mut notes = Vec::new();
    let (line_re, digits) = (tab_line_regex(), digits_regex());
    for line in text.lines() {
        let Some(caps) = line_re.captures(line) else {
            continue;
        };
        let Some(string_index) = caps.get(1).and_then(|m| tab_row_string(m.as_str())) else {
            continue;
        };
        let Some(body) = caps.get(2) else {
            continue;
        };
        for m in digits.find_iter(body.as_str()) {
            if let Ok(fret) = m.as_str().parse::<u32>() {
                notes.push(TabNote {
                    string_index,
                    fret,
                    column: m.start(),
                });
            }
        }
    }
    notes.sort_by_key(|n| (n.column, n.string_index));
    notes
}

// ─── Timing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingGrade {
    Perfect,
    Excellent,
    Good,
    Okay,
    Miss,
    TooLate,
}

impl TimingGrade {
    pub fn score(self) -> u32 {
        match self {
            TimingGrade::Perfect => 10,
            TimingGrade::Excellent => 8,
            TimingGrade::Good => 6,
            TimingGrade::Okay => 4,
            TimingGrade::Miss => 2,
            TimingGrade::TooLate => 0,
        }
    }
}

/// Grade by absolute offset between expected and actual onset.
pub fn grade_timing(expected_ms: i64, actual_ms: i64) -> TimingGrade {
    match (actual_ms - expected_ms).unsigned_abs() {
        0..=10 => TimingGrade::Perfect,
        11..=20 => TimingGrade::Excellent,
        21..=40 => TimingGrade::Good,
        41..=80 => TimingGrade::Okay,
        81..=100 => TimingGrade::Miss,
        _ => TimingGrade::TooLate,
    }
}
