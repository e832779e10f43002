//! Classifier adapter: an `allow | unknown` opinion on a device identity.
//!
//! The adapter never fails. A missing or corrupt model artifact, a checksum
//! mismatch, or a value the model has never seen all yield
//! [`Prediction::Unknown`], which hands the decision to a human.

#![allow(missing_docs)]

pub mod tree;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::config::ClassifierConfig;
use crate::device::identity::DeviceIdentity;

pub use tree::DecisionTreePredictor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prediction {
    Allow,
    Unknown,
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Anything that can express an opinion on a device.
pub trait Predictor: Send + Sync {
    fn predict(&self, identity: &DeviceIdentity) -> Prediction;
}

/// Holds the currently loaded predictor, if any. Reloadable in place.
pub struct ClassifierAdapter {
    model_file: Option<PathBuf>,
    model_sha256: Option<String>,
    predictor: RwLock<Option<Arc<dyn Predictor>>>,
}

impl ClassifierAdapter {
    /// Adapter that always answers `Unknown`.
    pub fn disabled() -> Self {
        Self {
            model_file: None,
            model_sha256: None,
            predictor: RwLock::new(None),
        }
    }

    /// Adapter around a fixed predictor (no artifact on disk).
    pub fn with_predictor(predictor: Arc<dyn Predictor>) -> Self {
        Self {
            model_file: None,
            model_sha256: None,
            predictor: RwLock::new(Some(predictor)),
        }
    }

    /// Build from config, loading the artifact if enabled. Load problems are
    /// reported and leave the adapter answering `Unknown`.
    pub fn from_config(cfg: &ClassifierConfig) -> Self {
        if !cfg.enabled {
            return Self::disabled();
        }
        let adapter = Self {
            model_file: Some(cfg.model_file.clone()),
            model_sha256: cfg.model_sha256.clone(),
            predictor: RwLock::new(None),
        };
        adapter.reload();
        adapter
    }

    pub fn model_file(&self) -> Option<&Path> {
        self.model_file.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.predictor.read().is_some()
    }

    /// Re-read the artifact from disk. Returns whether a model is now loaded.
    ///
    /// A failed reload drops the previous model rather than keep serving one
    /// that no longer matches the file on disk.
    pub fn reload(&self) -> bool {
        let Some(path) = self.model_file.as_deref() else {
            return self.is_loaded();
        };
        let loaded: Option<Arc<dyn Predictor>> = if path.exists() {
            match DecisionTreePredictor::load(path, self.model_sha256.as_deref()) {
                Ok(tree) => {
                    eprintln!(
                        "[UGK-CLASSIFIER] loaded {} ({} nodes)",
                        path.display(),
                        tree.node_count()
                    );
                    Some(Arc::new(tree))
                }
                Err(e) => {
                    eprintln!("[UGK-CLASSIFIER] ignoring model: {e}");
                    None
                }
            }
        } else {
            None
        };
        let is_loaded = loaded.is_some();
        *self.predictor.write() = loaded;
        is_loaded
    }

    pub fn predict(&self, identity: &DeviceIdentity) -> Prediction {
        let predictor = self.predictor.read().clone();
        predictor.map_or(Prediction::Unknown, |p| p.predict(identity))
    }
}

impl fmt::Debug for ClassifierAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierAdapter")
            .field("model_file", &self.model_file)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}
