//! JSONL session reader: parses recorded sessions back into DetectionFrames.
//!
//! Reads the header line (format, fps, tuning) then yields frames one at a
//! time. Works with any `BufRead`: files, in-memory buffers, stdin.

use crate::data_logger::SESSION_FORMAT;
use crate::types::DetectionFrame;
use std::io::BufRead;

/// Parsed JSONL header (first line of a session file).
#[derive(Debug)]
pub struct SessionHeader {
    pub format: String,
    pub fps: u32,
    pub tuning: String,
    pub raw: serde_json::Value,
}

/// Line-by-line JSONL session reader.
pub struct SessionReader<R: BufRead> {
    reader: R,
    pub header: SessionHeader,
    line_buf: String,
}

impl<R: BufRead> SessionReader<R> {
    /// Read and validate the header line. Returns an error if the header
    /// is missing, unparseable, or lacks a `"format": "fret-vision"` field.
    pub fn open(mut reader: R) -> Result<Self, String> {
        let mut first_line = String::new();
        reader
            .read_line(&mut first_line)
            .map_err(|e| format!("read header: {}", e))?;

        let first_line = first_line.trim();
        if first_line.is_empty() {
            return Err("empty file".into());
        }

        let raw: serde_json::Value =
            serde_json::from_str(first_line).map_err(|e| format!("parse header: {}", e))?;

        let format = raw["format"]
            .as_str()
            .ok_or("missing \"format\" field")?
            .to_string();
        if format != SESSION_FORMAT {
            return Err(format!("unknown format: {}", format));
        }

        let fps = raw["fps"].as_u64().unwrap_or(10) as u32;
        let tuning = raw["tuning"].as_str().unwrap_or("Standard").to_string();

        Ok(Self {
            reader,
            header: SessionHeader {
                format,
                fps,
                tuning,
                raw,
            },
            line_buf: String::new(),
        })
    }

    /// Read the next frame. Returns `None` at EOF, `Err` for unparseable lines.
    pub fn next_frame(&mut self) -> Option<Result<DetectionFrame, String>> {
        loop {
            self.line_buf.clear();
            match self.reader.read_line(&mut self.line_buf) {
                Ok(0) => return None,
                Ok(_) => {
                    let trimmed = self.line_buf.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Some(
                        serde_json::from_str::<DetectionFrame>(trimmed)
                            .map_err(|e| format!("parse frame: {}", e)),
                    );
                }
                Err(e) => return Some(Err(format!("read line: {}", e))),
            }
        }
    }

    /// Read all remaining frames, skipping malformed lines.
    pub fn read_all(mut self) -> Vec<DetectionFrame> {
        let mut frames = Vec::new();
        while let Some(result) = self.next_frame() {
            if let Ok(frame) = result {
                frames.push(frame);
            }
        }
        frames
    }
}

impl<R: BufRead> Iterator for SessionReader<R> {
    type Item = Result<DetectionFrame, String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }
}
