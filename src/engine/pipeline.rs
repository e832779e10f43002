//! Decision pipeline: history override → classifier → human prompt.
//!
//! Strict order, first match wins. The pipeline only decides; recording and
//! enforcement belong to the admission engine.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::classifier::{ClassifierAdapter, Prediction};
use crate::device::identity::DeviceIdentity;
use crate::engine::prompt::Prompter;
use crate::history::record::{Decision, DecisionSource};
use crate::history::store::HistoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub source: DecisionSource,
    pub remember: bool,
}

pub struct DecisionPipeline {
    history: Arc<dyn HistoryStore>,
    classifier: Arc<ClassifierAdapter>,
    prompter: Arc<dyn Prompter>,
    auto_allow_threshold: u64,
}

impl DecisionPipeline {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        classifier: Arc<ClassifierAdapter>,
        prompter: Arc<dyn Prompter>,
        auto_allow_threshold: u64,
    ) -> Self {
        Self {
            history,
            classifier,
            prompter,
            auto_allow_threshold,
        }
    }

    pub fn classifier(&self) -> &ClassifierAdapter {
        &self.classifier
    }

    /// Decide for one identity. Never fails: a prompt failure blocks.
    ///
    /// A remembered human allow increments the vendor counter before
    /// returning; a counter write failure is reported but does not change
    /// the verdict.
    pub fn decide(&self, identity: &DeviceIdentity) -> Verdict {
        let count = self.history.vendor_allow_count(&identity.vendor_id);
        if count >= self.auto_allow_threshold {
            return Verdict {
                decision: Decision::Allow,
                source: DecisionSource::History,
                remember: false,
            };
        }

        if self.classifier.predict(identity) == Prediction::Allow {
            return Verdict {
                decision: Decision::Allow,
                source: DecisionSource::Classifier,
                remember: false,
            };
        }

        match self.prompter.prompt(identity) {
            Ok(reply) => {
                let remember = reply.decision == Decision::Allow && reply.remember;
                if remember
                    && let Err(e) = self
                        .history
                        .increment_vendor_allow_count(&identity.vendor_id)
                {
                    eprintln!(
                        "[UGK-ENGINE] failed to update allow count for vendor {}: {e}",
                        identity.vendor_id
                    );
                }
                Verdict {
                    decision: reply.decision,
                    source: DecisionSource::Prompt,
                    remember,
                }
            }
            Err(e) => {
                eprintln!("[UGK-ENGINE] prompt failed for {identity}: {e}; blocking");
                Verdict {
                    decision: Decision::Block,
                    source: DecisionSource::FailClosed,
                    remember: false,
                }
            }
        }
    }
}
