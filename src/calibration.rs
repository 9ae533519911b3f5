//! Calibration artifacts: the persisted filter chain, the shared snapshot
//! the live loop reads, the acceptance policy and the cancel signal.
//!
//! The search itself lives in `calibrator.rs`.

use crate::error::StoreError;
use crate::filters::FilterCatalog;
use crate::types::{describe_chain, CalibrationResult, FilterChain, FilterStep};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ─── Persistence ────────────────────────────────────────────────────────────

/// On-disk record: `{"filterChain": [{"filter": "brightness", "param": 30}]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChain {
    pub filter_chain: FilterChain,
}

/// Key-value slot holding the current filter chain.
pub trait FilterChainStore: Send {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<FilterChain>, StoreError>;
    fn save(&mut self, chain: &[FilterStep]) -> Result<(), StoreError>;
}

/// Chain stored as pretty JSON in a single file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FilterChainStore for JsonFileStore {
    fn load(&self) -> Result<Option<FilterChain>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)?;
        let stored: StoredChain = serde_json::from_str(&data)?;
        info!(
            "Loaded filter chain from {:?}: {}",
            self.path,
            describe_chain(&stored.filter_chain)
        );
        Ok(Some(stored.filter_chain))
    }

    fn save(&mut self, chain: &[FilterStep]) -> Result<(), StoreError> {
        let stored = StoredChain {
            filter_chain: chain.to_vec(),
        };
        let json = serde_json::to_string_pretty(&stored)?;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        std::fs::write(&self.path, json)?;
        info!("Filter chain saved to {:?}", self.path);
        Ok(())
    }
}

/// In-process store, for tests and sessions that should not touch disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    chain: Option<FilterChain>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FilterChainStore for MemoryStore {
    fn load(&self) -> Result<Option<FilterChain>, StoreError> {
        Ok(self.chain.clone())
    }

    fn save(&mut self, chain: &[FilterStep]) -> Result<(), StoreError> {
        self.chain = Some(chain.to_vec());
        Ok(())
    }
}

/// Load the stored chain and check every step against `catalog`.
/// Nothing stored yields an empty chain.
pub fn load_chain(
    store: &dyn FilterChainStore,
    catalog: &FilterCatalog,
) -> Result<FilterChain, StoreError> {
    let chain = store.load()?.unwrap_or_default();
    catalog.validate_chain(&chain)?;
    Ok(chain)
}

/// Like [`load_chain`] but never fails: a missing, unreadable or invalid
/// record falls back to the empty chain with a warning.
pub fn load_chain_or_default(store: &dyn FilterChainStore, catalog: &FilterCatalog) -> FilterChain {
    match load_chain(store, catalog) {
        Ok(chain) => chain,
        Err(e) => {
            warn!("Ignoring stored filter chain: {}", e);
            FilterChain::new()
        }
    }
}

// ─── Shared snapshot ────────────────────────────────────────────────────────

/// The live filter chain. Readers take a whole-chain snapshot once per frame;
/// a finished calibration swaps in a new chain in one step, so a frame never
/// sees half of an old chain and half of a new one.
#[derive(Clone, Default)]
pub struct SharedChain {
    inner: Arc<Mutex<Arc<FilterChain>>>,
}

impl SharedChain {
    pub fn new(chain: FilterChain) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Arc::new(chain))),
        }
    }

    pub fn snapshot(&self) -> Arc<FilterChain> {
        match self.inner.lock() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, chain: FilterChain) {
        let next = Arc::new(chain);
        match self.inner.lock() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

// ─── Policy ─────────────────────────────────────────────────────────────────

/// What the caller should do with a calibration result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationVerdict {
    /// Reached the target; persist and apply the chain
    Accepted,
    /// Baseline so low there is probably no guitar in frame
    NoGuitarDetected,
    /// Improved but short of the target; ask the user to retry
    BelowTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationPolicy {
    pub success_threshold: f32,
    pub no_guitar_threshold: f32,
}

impl Default for CalibrationPolicy {
    fn default() -> Self {
        Self {
            success_threshold: 0.8,
            no_guitar_threshold: 0.3,
        }
    }
}

impl CalibrationPolicy {
    pub fn verdict(&self, result: &CalibrationResult) -> CalibrationVerdict {
        if result.achieved_confidence >= self.success_threshold {
            CalibrationVerdict::Accepted
        } else if result.baseline_confidence < self.no_guitar_threshold
            && result.achieved_confidence < self.no_guitar_threshold
        {
            CalibrationVerdict::NoGuitarDetected
        } else {
            CalibrationVerdict::BelowTarget
        }
    }
}

// ─── Cancellation ───────────────────────────────────────────────────────────

/// Cooperative cancel signal, checked between candidate tests.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
