//! Records raw detection frames as a JSONL session for later replay.
//!
//! Layout: `<output_dir>/session_<unix secs>/detections.jsonl` (header line
//! then one `DetectionFrame` per line) plus `stats.json` on shutdown.

use crate::types::DetectionFrame;
use crossbeam_channel::Receiver;
use log::{error, info};
use serde_json::json;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SESSION_FORMAT: &str = "fret-vision";
pub const DETECTIONS_FILE: &str = "detections.jsonl";

pub struct DataLogger {
    rx: Receiver<DetectionFrame>,
    session_dir: PathBuf,
    fps: u32,
    tuning: String,
}

impl DataLogger {
    pub fn new(
        rx: Receiver<DetectionFrame>,
        output_dir: &Path,
        fps: u32,
        tuning: &str,
    ) -> io::Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let session_dir = output_dir.join(format!("session_{}", timestamp));
        fs::create_dir_all(&session_dir)?;
        Ok(Self {
            rx,
            session_dir,
            fps,
            tuning: tuning.to_string(),
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn detections_path(&self) -> PathBuf {
        self.session_dir.join(DETECTIONS_FILE)
    }

    /// Write frames until the channel closes. Blocks the calling thread.
    /// Returns the number of frames written.
    pub fn run(&self) -> io::Result<u64> {
        info!("Data logger → {:?}", self.session_dir);
        let file = File::create(self.detections_path())?;
        let mut writer = BufWriter::new(file);

        let header = json!({
            "format": SESSION_FORMAT,
            "version": env!("CARGO_PKG_VERSION"),
            "fps": self.fps,
            "tuning": self.tuning,
        });
        writeln!(writer, "{}", header)?;

        let mut frame_count: u64 = 0;
        let mut detection_count: u64 = 0;
        for frame in self.rx.iter() {
            let line = serde_json::to_string(&frame).map_err(io::Error::other)?;
            writeln!(writer, "{}", line)?;
            frame_count += 1;
            detection_count += frame.detections.len() as u64;
            if frame_count % 500 == 0 {
                writer.flush()?;
                info!("Logged {} frames", frame_count);
            }
        }
        writer.flush()?;

        let stats = json!({
            "total_frames": frame_count,
            "total_detections": detection_count,
        });
        let stats_json = serde_json::to_string_pretty(&stats).map_err(io::Error::other)?;
        fs::write(self.session_dir.join("stats.json"), stats_json)
            .unwrap_or_else(|e| error!("Failed to write stats: {}", e));

        info!("Session saved: {} frames → {:?}", frame_count, self.session_dir);
        Ok(frame_count)
    }
}
