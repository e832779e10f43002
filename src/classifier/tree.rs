//! Decision-tree predictor evaluated from a JSON model artifact.
//!
//! Artifact layout:
//!
//! ```json
//! {
//!   "encoders": { "vendor": ["0781", "abcd"], "product": ["5567"], "serial": ["ABC"] },
//!   "nodes": [
//!     { "feature": "vendor", "threshold": 0.5, "left": 1, "right": 2 },
//!     { "class": 1 },
//!     { "class": 0 }
//!   ]
//! }
//! ```
//!
//! Each encoder is the sorted class list of a label encoder: a value encodes
//! to its index. Splits go left when `encoded <= threshold`. Node 0 is the
//! root. Class `1` means allow; every other class is treated as no opinion.

#![allow(missing_docs)]

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::classifier::{Prediction, Predictor};
use crate::core::errors::{Result, UgkError};
use crate::device::identity::DeviceIdentity;

const ALLOW_CLASS: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Vendor,
    Product,
    Serial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: Feature,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        class: u8,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoders {
    #[serde(default)]
    pub vendor: Vec<String>,
    #[serde(default)]
    pub product: Vec<String>,
    #[serde(default)]
    pub serial: Vec<String>,
}

impl LabelEncoders {
    fn encode(&self, feature: Feature, value: &str) -> Option<usize> {
        let classes = match feature {
            Feature::Vendor => &self.vendor,
            Feature::Product => &self.product,
            Feature::Serial => &self.serial,
        };
        classes.iter().position(|c| c == value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeArtifact {
    pub encoders: LabelEncoders,
    pub nodes: Vec<TreeNode>,
}

/// Validated decision tree.
#[derive(Debug, Clone)]
pub struct DecisionTreePredictor {
    artifact: TreeArtifact,
}

impl DecisionTreePredictor {
    /// Validate node references so evaluation cannot index out of bounds
    /// or loop.
    pub fn from_artifact(artifact: TreeArtifact) -> Result<Self> {
        let len = artifact.nodes.len();
        if len == 0 {
            return Err(UgkError::ClassifierArtifact {
                details: "tree has no nodes".to_string(),
            });
        }
        for (idx, node) in artifact.nodes.iter().enumerate() {
            if let TreeNode::Split {
                threshold,
                left,
                right,
                ..
            } = node
            {
                if !threshold.is_finite() {
                    return Err(UgkError::ClassifierArtifact {
                        details: format!("node {idx}: threshold is not finite"),
                    });
                }
                // Children always point forward, which rules out cycles.
                for child in [*left, *right] {
                    if child <= idx || child >= len {
                        return Err(UgkError::ClassifierArtifact {
                            details: format!("node {idx}: invalid child index {child}"),
                        });
                    }
                }
            }
        }
        Ok(Self { artifact })
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let artifact: TreeArtifact =
            serde_json::from_str(raw).map_err(|e| UgkError::ClassifierArtifact {
                details: format!("artifact parse error: {e}"),
            })?;
        Self::from_artifact(artifact)
    }

    /// Load from disk, optionally checking the file's SHA-256 first.
    pub fn load(path: &Path, expected_sha256: Option<&str>) -> Result<Self> {
        let bytes = fs::read(path).map_err(|source| UgkError::io(path, source))?;
        if let Some(expected) = expected_sha256 {
            let actual = sha256_hex(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(UgkError::ClassifierArtifact {
                    details: format!(
                        "{}: sha256 mismatch (expected {expected}, got {actual})",
                        path.display()
                    ),
                });
            }
        }
        let raw = String::from_utf8(bytes).map_err(|e| UgkError::ClassifierArtifact {
            details: format!("{}: not utf-8: {e}", path.display()),
        })?;
        Self::from_json(&raw)
    }

    pub fn node_count(&self) -> usize {
        self.artifact.nodes.len()
    }

    /// Leaf class for `identity`, or `None` if any value it needs was never
    /// seen by the encoders.
    fn classify(&self, identity: &DeviceIdentity) -> Option<u8> {
        let mut idx = 0;
        loop {
            match self.artifact.nodes.get(idx)? {
                TreeNode::Leaf { class } => return Some(*class),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let value = match feature {
                        Feature::Vendor => &identity.vendor_id,
                        Feature::Product => &identity.product_id,
                        Feature::Serial => &identity.serial,
                    };
                    let encoded = self.artifact.encoders.encode(*feature, value)?;
                    #[allow(clippy::cast_precision_loss)]
                    let encoded = encoded as f64;
                    idx = if encoded <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

impl Predictor for DecisionTreePredictor {
    fn predict(&self, identity: &DeviceIdentity) -> Prediction {
        match self.classify(identity) {
            Some(ALLOW_CLASS) => Prediction::Allow,
            _ => Prediction::Unknown,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}
