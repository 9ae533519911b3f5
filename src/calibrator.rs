//! Greedy filter-chain calibration.
//!
//! One reference frame is captured and every test reuses it. Filters are
//! visited in catalog order; for each, every candidate parameter is tried on
//! a fresh copy of the frame with the chain built so far plus that candidate.
//! The best candidate is appended only if it strictly beats the current best,
//! so achieved confidence never drops below the baseline.

use crate::calibration::CancelFlag;
use crate::error::CalibrationError;
use crate::filters::FilterCatalog;
use crate::inference::Detector;
use crate::types::{describe_chain, CalibrationResult, Detection, FilterChain, FilterStep};
use image::RgbaImage;
use log::{debug, info, warn};

/// Advisory progress, sent after every candidate test.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationProgress {
    /// `filter_index / total_filters * 100`
    pub percent: f32,
    pub filter: String,
    /// Chain under test, e.g. `brightness(30) → contrast(-30)`
    pub testing: String,
    pub confidence: f32,
}

/// Mean confidence over detections; 0 for none.
pub fn avg_confidence(detections: &[Detection]) -> f32 {
    if detections.is_empty() {
        return 0.0;
    }
    detections.iter().map(|d| d.confidence).sum::<f32>() / detections.len() as f32
}

pub struct Calibrator<'a> {
    catalog: &'a FilterCatalog,
    cancel: CancelFlag,
}

impl<'a> Calibrator<'a> {
    pub fn new(catalog: &'a FilterCatalog) -> Self {
        Self {
            catalog,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run the search on `frame`. Returns `Cancelled` if the flag is raised
    /// before any test; no partial chain is returned in that case.
    pub fn run<D, F>(
        &self,
        frame: &RgbaImage,
        detector: &mut D,
        mut on_progress: F,
    ) -> Result<CalibrationResult, CalibrationError>
    where
        D: Detector + ?Sized,
        F: FnMut(&CalibrationProgress),
    {
        self.check_cancel()?;
        let baseline = self.score(frame, &[], detector);
        info!("Calibration baseline confidence {:.3}", baseline);

        let mut chain: FilterChain = Vec::new();
        let mut current_best = baseline;
        let total = self.catalog.len().max(1);

        for (index, filter) in self.catalog.iter().enumerate() {
            let percent = index as f32 / total as f32 * 100.0;
            let mut best_for_filter: Option<(FilterStep, f32)> = None;

            for &param in filter.candidates() {
                self.check_cancel()?;
                let step = FilterStep::new(filter.name(), param);
                let mut test_chain = chain.clone();
                test_chain.push(step.clone());

                let confidence = self.score(frame, &test_chain, detector);
                let testing = describe_chain(&test_chain);
                debug!("  {} → {:.3}", testing, confidence);
                on_progress(&CalibrationProgress {
                    percent,
                    filter: filter.name().to_string(),
                    testing,
                    confidence,
                });

                let floor = best_for_filter.as_ref().map_or(current_best, |(_, c)| *c);
                if confidence > floor {
                    best_for_filter = Some((step, confidence));
                }
            }

            if let Some((step, confidence)) = best_for_filter {
                info!(
                    "  keep {}({}): {:.3} → {:.3}",
                    step.filter, step.param, current_best, confidence
                );
                chain.push(step);
                current_best = confidence;
            } else {
                debug!("  skip {}: no candidate beat {:.3}", filter.name(), current_best);
            }
        }

        info!(
            "Calibration done: {} ({:.3} → {:.3})",
            describe_chain(&chain),
            baseline,
            current_best
        );
        Ok(CalibrationResult {
            baseline_confidence: baseline,
            filter_chain: chain,
            achieved_confidence: current_best,
        })
    }

    fn check_cancel(&self) -> Result<(), CalibrationError> {
        if self.cancel.is_cancelled() {
            info!("Calibration cancelled");
            return Err(CalibrationError::Cancelled);
        }
        Ok(())
    }

    /// Apply `chain` to a copy of `frame` and average the confidence of every
    /// returned detection. Filter or inference failure scores 0.
    fn score<D: Detector + ?Sized>(&self, frame: &RgbaImage, chain: &[FilterStep], detector: &mut D) -> f32 {
        let mut image = frame.clone();
        if let Err(e) = self.catalog.apply_chain(&mut image, chain) {
            warn!("Filter chain {} failed: {}", describe_chain(chain), e);
            return 0.0;
        }
        match detector.infer(&image) {
            Ok(detections) => avg_confidence(&detections),
            Err(e) => {
                warn!("Inference failed during calibration: {}", e);
                0.0
            }
        }
    }
}

/// Run a calibration with a fresh calibrator.
pub fn calibrate<D, F>(
    frame: &RgbaImage,
    catalog: &FilterCatalog,
    detector: &mut D,
    on_progress: F,
    cancel: &CancelFlag,
) -> Result<CalibrationResult, CalibrationError>
where
    D: Detector + ?Sized,
    F: FnMut(&CalibrationProgress),
{
    Calibrator::new(catalog)
        .with_cancel(cancel.clone())
        .run(frame, detector, on_progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use crate::filters::luma_stats;
    use crate::types::{BBox, FilterParam};
    use image::Rgba;

    /// Confidence peaks when mean luma is mid-grey.
    struct ExposureDetector {
        calls: usize,
    }

    impl Detector for ExposureDetector {
        fn infer(&mut self, image: &RgbaImage) -> Result<Vec<Detection>, InferenceError> {
            self.calls += 1;
            let (mean, _) = luma_stats(image);
            let conf = 1.0 - (mean - 128.0).abs() / 128.0;
            let bbox = BBox { x: 10.0, y: 10.0, width: 4.0, height: 4.0 };
            Ok(vec![Detection::bbox("Zone1", conf, bbox)])
        }
    }

    struct EmptyDetector;

    impl Detector for EmptyDetector {
        fn infer(&mut self, _: &RgbaImage) -> Result<Vec<Detection>, InferenceError> {
            Ok(Vec::new())
        }
    }

    fn frame(level: u8) -> RgbaImage {
        RgbaImage::from_pixel(8, 8, Rgba([level, level, level, 255]))
    }

    #[test]
    fn test_empty_detections_give_empty_chain() {
        let catalog = FilterCatalog::calibration_default();
        let result = calibrate(&frame(60), &catalog, &mut EmptyDetector, |_| {}, &CancelFlag::new()).unwrap();
        assert_eq!(result.baseline_confidence, 0.0);
        assert!(result.filter_chain.is_empty());
        assert_eq!(result.achieved_confidence, 0.0);
    }

    #[test]
    fn test_dark_frame_gets_brightened() {
        let catalog = FilterCatalog::calibration_default();
        let mut det = ExposureDetector { calls: 0 };
        let mut progress = Vec::new();
        let result = calibrate(&frame(68), &catalog, &mut det, |p| progress.push(p.clone()), &CancelFlag::new()).unwrap();

        assert!((result.baseline_confidence - (1.0 - 60.0 / 128.0)).abs() < 1e-3);
        assert_eq!(
            result.filter_chain,
            vec![FilterStep::new("brightness", FilterParam::Number(60.0))]
        );
        assert!((result.achieved_confidence - 1.0).abs() < 1e-3);
        assert!(result.achieved_confidence >= result.baseline_confidence);
        // baseline + 5 + 5 + 2 + 2
        assert_eq!(det.calls, 15);
        assert_eq!(progress.len(), 14);
        assert_eq!(progress[0].percent, 0.0);
        assert_eq!(progress[5].percent, 25.0);
        assert_eq!(progress[5].testing, "brightness(60) → contrast(-60)");
    }

    #[test]
    fn test_every_detection_counts() {
        struct ZoneAndHand;
        impl Detector for ZoneAndHand {
            fn infer(&mut self, _: &RgbaImage) -> Result<Vec<Detection>, InferenceError> {
                let bbox = BBox { x: 10.0, y: 10.0, width: 4.0, height: 4.0 };
                Ok(vec![
                    Detection::bbox("Zone1", 0.9, bbox),
                    Detection::bbox("Hand", 0.1, bbox),
                ])
            }
        }
        let catalog = FilterCatalog::new(Vec::new());
        let result = calibrate(&frame(128), &catalog, &mut ZoneAndHand, |_| {}, &CancelFlag::new()).unwrap();
        assert!((result.baseline_confidence - 0.5).abs() < 1e-6);
        assert!((result.achieved_confidence - 0.5).abs() < 1e-6);
        assert!(result.filter_chain.is_empty());
    }

    #[test]
    fn test_inference_failure_scores_zero() {
        struct Flaky;
        impl Detector for Flaky {
            fn infer(&mut self, image: &RgbaImage) -> Result<Vec<Detection>, InferenceError> {
                let (mean, _) = luma_stats(image);
                if mean > 100.0 {
                    return Err(InferenceError::Backend("timeout".into()));
                }
                let bbox = BBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0 };
                Ok(vec![Detection::bbox("Zone1", mean / 100.0, bbox)])
            }
        }
        let catalog = FilterCatalog::calibration_default();
        let result = calibrate(&frame(50), &catalog, &mut Flaky, |_| {}, &CancelFlag::new()).unwrap();
        // +30 reaches 80, +60 hits 110 and fails
        assert_eq!(
            result.filter_chain[0],
            FilterStep::new("brightness", FilterParam::Number(30.0))
        );
        assert!(result.achieved_confidence >= result.baseline_confidence);
    }

    #[test]
    fn test_cancel_midway() {
        struct Cancelling {
            flag: CancelFlag,
            calls: usize,
        }
        impl Detector for Cancelling {
            fn infer(&mut self, _: &RgbaImage) -> Result<Vec<Detection>, InferenceError> {
                self.calls += 1;
                if self.calls == 3 {
                    self.flag.cancel();
                }
                Ok(Vec::new())
            }
        }
        let flag = CancelFlag::new();
        let catalog = FilterCatalog::calibration_default();
        let mut det = Cancelling { flag: flag.clone(), calls: 0 };
        let result = calibrate(&frame(10), &catalog, &mut det, |_| {}, &flag);
        assert_eq!(result, Err(CalibrationError::Cancelled));
        assert_eq!(det.calls, 3, "no test may start after cancel");
    }

    #[test]
    fn test_cancel_before_start() {
        let flag = CancelFlag::new();
        flag.cancel();
        let catalog = FilterCatalog::calibration_default();
        let mut det = ExposureDetector { calls: 0 };
        let calibrator = Calibrator::new(&catalog).with_cancel(flag);
        assert_eq!(
            calibrator.run(&frame(10), &mut det, |_| {}),
            Err(CalibrationError::Cancelled)
        );
        assert_eq!(det.calls, 0);
    }

    #[test]
    fn test_avg_confidence() {
        assert_eq!(avg_confidence(&[]), 0.0);
        let b = BBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0 };
        let dets = vec![Detection::bbox("Zone1", 0.5, b), Detection::bbox("Zone2", 1.0, b)];
        assert!((avg_confidence(&dets) - 0.75).abs() < 1e-6);
    }
}
