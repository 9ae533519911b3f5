use crate::overlay::OverlayFrame;
use crate::types::*;
use crossbeam_channel::Receiver;
use std::io::{self, Write};

const INNER_WIDTH: usize = 58;
const STRING_NAMES: [&str; NUM_STRINGS] = ["E", "A", "D", "G", "B", "e"];

/// Renders a live ASCII dashboard of the overlay state.
pub struct ConsoleDisplay {
    rx: Receiver<OverlayFrame>,
    fps: u32,
    update_hz: u32,
}

impl ConsoleDisplay {
    pub fn new(rx: Receiver<OverlayFrame>, fps: u32, update_hz: u32) -> Self {
        Self { rx, fps, update_hz }
    }

    pub fn run(&self) {
        let skip = if self.update_hz == 0 { 50 } else { (self.fps / self.update_hz).max(1) as u64 };
        let mut count: u64 = 0;
        let mut stdout = io::stdout();

        for frame in self.rx.iter() {
            count += 1;
            if count % skip != 0 {
                continue;
            }

            // Clear screen and move cursor home
            print!("\x1b[2J\x1b[H");
            for line in dashboard(&frame) {
                println!("{}", line);
            }
            let _ = stdout.flush();
        }
    }
}

/// Box-drawn summary of one overlay frame.
pub fn dashboard(frame: &OverlayFrame) -> Vec<String> {
    let rule = "═".repeat(INNER_WIDTH);
    let mut lines = vec![
        format!("╔{}╗", rule),
        row("FRET VISION · Live Monitor"),
        format!("╠{}╣", rule),
        row(&format!("Time: {:.2}s", frame.timestamp_ms as f64 / 1000.0)),
        row(&format!(
            "Zones: {:<3} Angle: {:>6.1}°  Scale: {:.2}x",
            frame.zone_count,
            frame.angle.to_degrees(),
            frame.scale_factor
        )),
        row(""),
    ];

    let count = |cat: NoteCategory| frame.points.iter().filter(|p| p.category == cat).count();
    lines.push(row(&format!(
        "Root {:<3} Scale {:<3} Arp {:<3} Lit {:<3} Other {:<3}",
        count(NoteCategory::Root),
        count(NoteCategory::InScale),
        count(NoteCategory::Arpeggio),
        count(NoteCategory::Highlighted),
        count(NoteCategory::Other),
    )));
    lines.push(row(""));

    if frame.points.is_empty() {
        lines.push(row("Neck: --- (no frets tracked)"));
    } else {
        lines.extend(fretboard(frame).iter().map(|l| row(l)));
        lines.push(row(""));
        lines.push(row("R root  ● scale  ◆ arpeggio  ★ highlighted  · other"));
    }
    lines.push(format!("╚{}╝", rule));
    lines
}

/// One text row per string, high e on top, one column per tracked fret.
fn fretboard(frame: &OverlayFrame) -> Vec<String> {
    let mut frets: Vec<u32> = frame.points.iter().map(|p| p.fret_number).collect();
    frets.sort_unstable();
    frets.dedup();

    let mut lines = Vec::with_capacity(NUM_STRINGS + 1);
    let header: String = frets.iter().map(|f| format!("{:>3}", f)).collect();
    lines.push(format!("   {}", header));
    for string_index in (0..NUM_STRINGS).rev() {
        let cells: String = frets
            .iter()
            .map(|&fret| {
                let mark = frame
                    .points
                    .iter()
                    .find(|p| p.string_index == string_index && p.fret_number == fret)
                    .map_or(' ', |p| symbol(p.category));
                format!("  {}", mark)
            })
            .collect();
        lines.push(format!("{} |{}", STRING_NAMES[string_index], cells));
    }
    lines
}

fn symbol(category: NoteCategory) -> char {
    match category {
        NoteCategory::Highlighted => '★',
        NoteCategory::Root => 'R',
        NoteCategory::Arpeggio => '◆',
        NoteCategory::InScale => '●',
        NoteCategory::Other => '·',
    }
}

/// Pad or truncate by char count so multi-byte glyphs keep the box square.
fn row(text: &str) -> String {
    let mut body: String = text.chars().take(INNER_WIDTH - 2).collect();
    while body.chars().count() < INNER_WIDTH - 2 {
        body.push(' ');
    }
    format!("║  {}║", body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::ScaleState;
    use crate::overlay::{HighlightState, OverlayRenderer};

    fn zone(fret: u32, x: f32) -> FretZone {
        FretZone {
            fret_number: fret,
            x_center: x,
            y_center: 100.0,
            y_min: 70.0,
            y_max: 130.0,
            width: 60.0,
            confidence: 0.9,
        }
    }

    #[test]
    fn test_dashboard_rows_are_aligned() {
        let frame = OverlayRenderer::default().render_frets(
            &[zone(1, 100.0), zone(2, 170.0), zone(3, 235.0)],
            &ScaleState::default(),
            &HighlightState::default(),
        );
        let lines = dashboard(&frame);
        let width = lines[0].chars().count();
        assert!(lines.iter().all(|l| l.chars().count() == width));
        assert!(lines.iter().any(|l| l.contains("Zones: 3")));
    }

    #[test]
    fn test_fretboard_marks_roots() {
        let frame = OverlayRenderer::default().render_frets(
            &[zone(1, 100.0), zone(3, 235.0)],
            &ScaleState::default(),
            &HighlightState::default(),
        );
        let grid = fretboard(&frame);
        assert_eq!(grid.len(), NUM_STRINGS + 1);
        // B string, fret 1 is C: the root of C major
        let b_row = grid.iter().find(|l| l.starts_with("B ")).unwrap();
        assert_eq!(b_row.chars().nth(5), Some('R'));
    }

    #[test]
    fn test_empty_frame() {
        let lines = dashboard(&OverlayFrame::default());
        assert!(lines.iter().any(|l| l.contains("no frets tracked")));
    }
}
