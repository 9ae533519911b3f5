//! Image preprocessing filters applied to frames before detection, and the
//! catalog calibration searches over.

use crate::error::FilterError;
use crate::types::{FilterParam, FilterStep};
use image::{imageops, Rgba, RgbaImage};

/// A named preprocessing operation with a discrete set of candidate
/// parameters for calibration.
pub trait ImageFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Parameters calibration tries, in order.
    fn candidates(&self) -> &[FilterParam];

    /// Apply in place. Rejects parameters of the wrong kind or range.
    fn apply(&self, image: &mut RgbaImage, param: FilterParam) -> Result<(), FilterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Additive offset on RGB
    Brightness,
    /// Contrast in -255..=255 using the 259 factor curve
    Contrast,
    Gamma,
    Grayscale,
    Invert,
    /// Per-channel histogram equalisation
    Histogram,
    /// Shift each channel mean to 128
    Normalize,
    /// Gray-world white balance
    WhiteBalance,
    /// Gaussian blur, param = sigma
    Blur,
    /// Unsharp mask, param = sigma
    Sharpen,
}

impl FilterKind {
    pub fn name(self) -> &'static str {
        match self {
            FilterKind::Brightness => "brightness",
            FilterKind::Contrast => "contrast",
            FilterKind::Gamma => "gamma",
            FilterKind::Grayscale => "grayscale",
            FilterKind::Invert => "invert",
            FilterKind::Histogram => "histogram",
            FilterKind::Normalize => "normalize",
            FilterKind::WhiteBalance => "whitebalance",
            FilterKind::Blur => "blur",
            FilterKind::Sharpen => "sharpen",
        }
    }
}

/// One of the built-in filters plus its candidate parameters.
pub struct BuiltinFilter {
    kind: FilterKind,
    candidates: Vec<FilterParam>,
}

impl BuiltinFilter {
    pub fn new(kind: FilterKind, candidates: Vec<FilterParam>) -> Self {
        Self { kind, candidates }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    fn number(&self, param: FilterParam) -> Result<f64, FilterError> {
        match param {
            FilterParam::Number(n) if n.is_finite() => Ok(n),
            other => Err(self.invalid(format!("expected a number, got {}", other))),
        }
    }

    fn flag(&self, param: FilterParam) -> Result<bool, FilterError> {
        match param {
            FilterParam::Flag(b) => Ok(b),
            other => Err(self.invalid(format!("expected true/false, got {}", other))),
        }
    }

    fn invalid(&self, msg: String) -> FilterError {
        FilterError::InvalidParam {
            filter: self.kind.name().to_string(),
            msg,
        }
    }
}

impl ImageFilter for BuiltinFilter {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn candidates(&self) -> &[FilterParam] {
        &self.candidates
    }

    fn apply(&self, image: &mut RgbaImage, param: FilterParam) -> Result<(), FilterError> {
        match self.kind {
            FilterKind::Brightness => {
                let offset = self.number(param)? as f32;
                map_rgb(image, |v| v + offset);
            }
            FilterKind::Contrast => {
                let c = self.number(param)?;
                if !(-255.0..=255.0).contains(&c) {
                    return Err(self.invalid(format!("contrast {} outside -255..=255", c)));
                }
                let factor = ((259.0 * (c + 255.0)) / (255.0 * (259.0 - c))) as f32;
                map_rgb(image, |v| factor * (v - 128.0) + 128.0);
            }
            FilterKind::Gamma => {
                let gamma = self.number(param)?;
                if gamma <= 0.0 {
                    return Err(self.invalid(format!("gamma {} must be positive", gamma)));
                }
                let inv = (1.0 / gamma) as f32;
                map_rgb(image, |v| (v / 255.0).powf(inv) * 255.0);
            }
            FilterKind::Grayscale => {
                if self.flag(param)? {
                    for px in image.pixels_mut() {
                        let avg = (px[0] as f32 + px[1] as f32 + px[2] as f32) / 3.0;
                        let g = to_u8(avg);
                        *px = Rgba([g, g, g, px[3]]);
                    }
                }
            }
            FilterKind::Invert => {
                if self.flag(param)? {
                    map_rgb(image, |v| 255.0 - v);
                }
            }
            FilterKind::Histogram => {
                if self.flag(param)? {
                    equalize_histogram(image);
                }
            }
            FilterKind::Normalize => {
                if self.flag(param)? {
                    let mean = channel_means(image);
                    map_channels(image, |c, v| v - mean[c] + 128.0);
                }
            }
            FilterKind::WhiteBalance => {
                if self.flag(param)? {
                    let mean = channel_means(image);
                    let gray = (mean[0] + mean[1] + mean[2]) / 3.0;
                    let scale = mean.map(|m| if m > 0.0 { gray / m } else { 1.0 });
                    map_channels(image, |c, v| v * scale[c]);
                }
            }
            FilterKind::Blur => {
                let sigma = self.number(param)?;
                if sigma <= 0.0 {
                    return Err(self.invalid(format!("sigma {} must be positive", sigma)));
                }
                *image = imageops::blur(image, sigma as f32);
            }
            FilterKind::Sharpen => {
                let sigma = self.number(param)?;
                if sigma <= 0.0 {
                    return Err(self.invalid(format!("sigma {} must be positive", sigma)));
                }
                *image = imageops::unsharpen(image, sigma as f32, 1);
            }
        }
        Ok(())
    }
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn map_rgb(image: &mut RgbaImage, f: impl Fn(f32) -> f32) {
    map_channels(image, |_, v| f(v));
}

fn map_channels(image: &mut RgbaImage, f: impl Fn(usize, f32) -> f32) {
    for px in image.pixels_mut() {
        for c in 0..3 {
            px[c] = to_u8(f(c, px[c] as f32));
        }
    }
}

fn channel_means(image: &RgbaImage) -> [f32; 3] {
    let n = (image.width() as u64 * image.height() as u64).max(1) as f64;
    let mut sum = [0u64; 3];
    for px in image.pixels() {
        for c in 0..3 {
            sum[c] += px[c] as u64;
        }
    }
    sum.map(|s| (s as f64 / n) as f32)
}

fn equalize_histogram(image: &mut RgbaImage) {
    for c in 0..3 {
        let mut hist = [0u64; 256];
        for px in image.pixels() {
            hist[px[c] as usize] += 1;
        }
        let mut cdf = [0u64; 256];
        let mut acc = 0u64;
        for (i, h) in hist.iter().enumerate() {
            acc += h;
            cdf[i] = acc;
        }
        let cdf_min = cdf.iter().copied().find(|&v| v > 0).unwrap_or(0);
        let total = cdf[255];
        if total <= cdf_min {
            // Single intensity in this channel; nothing to spread.
            continue;
        }
        let range = (total - cdf_min) as f64;
        for px in image.pixels_mut() {
            let v = cdf[px[c] as usize].saturating_sub(cdf_min) as f64 / range * 255.0;
            px[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Mean and standard deviation of luma (Rec. 601 weights) over the image.
pub fn luma_stats(image: &RgbaImage) -> (f32, f32) {
    let n = (image.width() as u64 * image.height() as u64) as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for px in image.pixels() {
        let y = 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64;
        sum += y;
        sum_sq += y * y;
    }
    let mean = sum / n;
    let var = (sum_sq / n - mean * mean).max(0.0);
    (mean as f32, var.sqrt() as f32)
}

// ─── Catalog ────────────────────────────────────────────────────────────────

/// Registered filters, in the order calibration visits them.
pub struct FilterCatalog {
    filters: Vec<Box<dyn ImageFilter>>,
}

impl FilterCatalog {
    pub fn new(filters: Vec<Box<dyn ImageFilter>>) -> Self {
        Self { filters }
    }

    /// brightness, contrast, grayscale, invert.
    pub fn calibration_default() -> Self {
        let levels = || [-60.0, -30.0, 0.0, 30.0, 60.0].map(FilterParam::Number).to_vec();
        let flags = || vec![FilterParam::Flag(true), FilterParam::Flag(false)];
        Self::new(vec![
            Box::new(BuiltinFilter::new(FilterKind::Brightness, levels())),
            Box::new(BuiltinFilter::new(FilterKind::Contrast, levels())),
            Box::new(BuiltinFilter::new(FilterKind::Grayscale, flags())),
            Box::new(BuiltinFilter::new(FilterKind::Invert, flags())),
        ])
    }

    /// The default set followed by every other built-in filter.
    pub fn extended() -> Self {
        let mut catalog = Self::calibration_default();
        let on = || vec![FilterParam::Flag(true)];
        catalog.push(Box::new(BuiltinFilter::new(
            FilterKind::Gamma,
            [0.8, 1.2, 1.5].map(FilterParam::Number).to_vec(),
        )));
        catalog.push(Box::new(BuiltinFilter::new(FilterKind::Histogram, on())));
        catalog.push(Box::new(BuiltinFilter::new(FilterKind::Normalize, on())));
        catalog.push(Box::new(BuiltinFilter::new(FilterKind::WhiteBalance, on())));
        catalog.push(Box::new(BuiltinFilter::new(
            FilterKind::Blur,
            [1.0, 2.0].map(FilterParam::Number).to_vec(),
        )));
        catalog.push(Box::new(BuiltinFilter::new(
            FilterKind::Sharpen,
            [1.0].map(FilterParam::Number).to_vec(),
        )));
        catalog
    }

    pub fn push(&mut self, filter: Box<dyn ImageFilter>) {
        self.filters.push(filter);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageFilter> {
        self.filters.iter().find(|f| f.name() == name).map(|f| f.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn ImageFilter> {
        self.filters.iter().map(|f| f.as_ref())
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Every step names a registered filter.
    pub fn validate_chain(&self, chain: &[FilterStep]) -> Result<(), FilterError> {
        for step in chain {
            if self.get(&step.filter).is_none() {
                return Err(FilterError::UnknownFilter(step.filter.clone()));
            }
        }
        Ok(())
    }

    /// Apply `chain` in order. Stops at the first failing step; the image
    /// may be partially processed in that case.
    pub fn apply_chain(&self, image: &mut RgbaImage, chain: &[FilterStep]) -> Result<(), FilterError> {
        for step in chain {
            let filter = self
                .get(&step.filter)
                .ok_or_else(|| FilterError::UnknownFilter(step.filter.clone()))?;
            filter.apply(image, step.param)?;
        }
        Ok(())
    }
}

impl Default for FilterCatalog {
    fn default() -> Self {
        Self::calibration_default()
    }
}
