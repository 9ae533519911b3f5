//! Detector seam and the inference service wrapping it.
//!
//! The model is external. A `Detector` turns an image into detections; the
//! `InferenceService` owns one, tracks its load status, publishes status
//! changes to subscribers and refuses a second call while one is in flight.

use crate::error::InferenceError;
use crate::types::{BBox, Detection, Point, Shape};
use crossbeam_channel::{unbounded, Receiver, Sender};
use image::RgbaImage;
use log::{info, trace, warn};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub trait Detector {
    fn infer(&mut self, image: &RgbaImage) -> Result<Vec<Detection>, InferenceError>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn infer(&mut self, image: &RgbaImage) -> Result<Vec<Detection>, InferenceError> {
        (**self).infer(image)
    }
}

// ─── Service ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    NotStarted,
    Loading,
    Ready,
    Failed(String),
}

/// Explicit, injectable owner of the detector. Share it behind an `Arc`.
pub struct InferenceService<D> {
    detector: Mutex<Option<D>>,
    status: Mutex<ServiceStatus>,
    subscribers: Mutex<Vec<Sender<ServiceStatus>>>,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when the call finishes, including on panic.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<D: Detector> InferenceService<D> {
    pub fn new() -> Self {
        Self {
            detector: Mutex::new(None),
            status: Mutex::new(ServiceStatus::NotStarted),
            subscribers: Mutex::new(Vec::new()),
            in_flight: AtomicBool::new(false),
        }
    }

    /// A service that is already `Ready` with `detector`.
    pub fn ready(detector: D) -> Self {
        let service = Self::new();
        if let Ok(mut slot) = service.detector.lock() {
            *slot = Some(detector);
        }
        if let Ok(mut status) = service.status.lock() {
            *status = ServiceStatus::Ready;
        }
        service
    }

    pub fn status(&self) -> ServiceStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    /// Status updates, starting with the current status.
    pub fn subscribe(&self) -> Receiver<ServiceStatus> {
        let (tx, rx) = unbounded();
        let _ = tx.send(self.status());
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    fn set_status(&self, next: ServiceStatus) {
        match self.status.lock() {
            Ok(mut s) => *s = next.clone(),
            Err(p) => *p.into_inner() = next.clone(),
        }
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(next.clone()).is_ok());
        }
    }

    /// Load the detector on the calling thread. Ignored unless the service
    /// is `NotStarted` or `Failed`.
    pub fn start<F>(&self, loader: F) -> ServiceStatus
    where
        F: FnOnce() -> Result<D, InferenceError>,
    {
        match self.status() {
            ServiceStatus::NotStarted | ServiceStatus::Failed(_) => {}
            current => {
                warn!("Inference service already {:?}; start ignored", current);
                return current;
            }
        }
        self.set_status(ServiceStatus::Loading);
        info!("Loading detector...");
        match loader() {
            Ok(detector) => {
                if let Ok(mut slot) = self.detector.lock() {
                    *slot = Some(detector);
                }
                info!("Detector ready");
                self.set_status(ServiceStatus::Ready);
            }
            Err(e) => {
                warn!("Detector failed to load: {}", e);
                self.set_status(ServiceStatus::Failed(e.to_string()));
            }
        }
        self.status()
    }

    /// Run one inference. `NotReady` before a successful start, `Busy` if
    /// another call has not returned yet.
    pub fn run_inference(&self, image: &RgbaImage) -> Result<Vec<Detection>, InferenceError> {
        if self.status() != ServiceStatus::Ready {
            return Err(InferenceError::NotReady);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(InferenceError::Busy);
        }
        let _guard = InFlight(&self.in_flight);
        let mut slot = self
            .detector
            .lock()
            .map_err(|_| InferenceError::Backend("detector lock poisoned".into()))?;
        match slot.as_mut() {
            Some(detector) => detector.infer(image),
            None => Err(InferenceError::NotReady),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl<D: Detector + Send + 'static> InferenceService<D> {
    /// Load the detector on a background thread.
    pub fn spawn_start<F>(self: &Arc<Self>, loader: F) -> std::io::Result<JoinHandle<()>>
    where
        F: FnOnce() -> Result<D, InferenceError> + Send + 'static,
    {
        let service = Arc::clone(self);
        thread::Builder::new()
            .name("detector-loader".into())
            .spawn(move || {
                service.start(loader);
            })
    }
}

impl<D: Detector> Default for InferenceService<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Detector> Detector for InferenceService<D> {
    fn infer(&mut self, image: &RgbaImage) -> Result<Vec<Detection>, InferenceError> {
        self.run_inference(image)
    }
}

impl<D: Detector> Detector for Arc<InferenceService<D>> {
    fn infer(&mut self, image: &RgbaImage) -> Result<Vec<Detection>, InferenceError> {
        self.run_inference(image)
    }
}

// ─── Prediction adapters ────────────────────────────────────────────────────

/// One prediction as hosted detectors send it. Field names vary between
/// sources (`class`/`className`, `confidence`/`score`) and geometry comes as
/// a polygon, a nested box or flat `x, y, width, height`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPrediction {
    #[serde(alias = "className")]
    pub class: Option<String>,
    #[serde(alias = "score")]
    pub confidence: Option<f32>,
    pub points: Option<Vec<Point>>,
    pub bbox: Option<BBox>,
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub width: Option<f32>,
    pub height: Option<f32>,
}

impl RawPrediction {
    pub fn into_detection(self) -> Result<Detection, InferenceError> {
        let label = self
            .class
            .ok_or_else(|| InferenceError::Malformed("missing class".into()))?;
        let confidence = self
            .confidence
            .filter(|c| c.is_finite())
            .ok_or_else(|| InferenceError::Malformed(format!("{}: missing confidence", label)))?;
        let shape = match (self.points, self.bbox, self.x, self.y, self.width, self.height) {
            (Some(points), _, _, _, _, _) if !points.is_empty() => Shape::Polygon { points },
            (_, Some(bbox), _, _, _, _) => Shape::BBox { bbox },
            (_, _, Some(x), Some(y), Some(width), Some(height)) => Shape::BBox {
                bbox: BBox { x, y, width, height },
            },
            _ => {
                return Err(InferenceError::Malformed(format!("{}: no geometry", label)));
            }
        };
        Ok(Detection {
            label,
            confidence,
            shape,
        })
    }
}

/// Parse a detector response: either a bare array of predictions or an
/// object with a `predictions` array. Malformed entries are dropped.
pub fn parse_predictions(json: &str) -> Result<Vec<Detection>, InferenceError> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| InferenceError::Malformed(e.to_string()))?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("predictions") {
            Some(serde_json::Value::Array(items)) => items,
            _ => return Err(InferenceError::Malformed("no predictions array".into())),
        },
        _ => return Err(InferenceError::Malformed("expected array or object".into())),
    };
    let mut detections = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<RawPrediction>(item)
            .map_err(|e| InferenceError::Malformed(e.to_string()))
            .and_then(RawPrediction::into_detection)
        {
            Ok(d) => detections.push(d),
            Err(e) => trace!("dropping prediction: {}", e),
        }
    }
    Ok(detections)
}
