//! Admission engine: per-device-node lifecycle state machine.
//!
//! ```text
//! Unseen ──attach (incomplete)──▶ Pending ──merge/deadline, complete──▶ claimed
//!    │                               └──deadline, still incomplete──▶ Unseen
//!    └──attach (complete)──▶ claimed ──pipeline──▶ Decided{Allow|Block}
//! Decided ──detach──▶ Removed (terminal; the next attach starts over)
//! ```
//!
//! Ingestion is split from processing. [`AdmissionEngine::ingest`] is cheap
//! and only touches the in-memory state under the engine lock; it tells the
//! caller what slow work (pipeline, prompt, enforcement) is now owed, and the
//! caller runs [`AdmissionEngine::process_attach`] /
//! [`AdmissionEngine::process_detach`] outside the lock, typically on a
//! worker thread. [`AdmissionEngine::handle_event`] does both in one call.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::errors::{Result, UgkError};
use crate::device::identity::{DeviceIdentity, HotplugAction, HotplugEvent};
use crate::enforce::gateway::{BlockOutcome, EnforcementGateway, UnmountOutcome};
use crate::engine::pipeline::DecisionPipeline;
use crate::history::record::{Decision, DecisionRecord};
use crate::history::store::HistoryStore;
use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle};

/// Work owed after ingesting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// Node claimed; run the pipeline for this identity.
    Attach(DeviceIdentity),
    /// Claim released; run unmount for this node.
    Detach(PathBuf),
    /// Incomplete attach parked until `retry_at`.
    Deferred {
        device_node: PathBuf,
        retry_at: Instant,
    },
    /// Attach for a node that is already claimed.
    Duplicate(PathBuf),
    /// Debounce deadline passed with vendor/product still missing.
    Expired(PathBuf),
    /// Detach for a node that was never claimed.
    Ignored(PathBuf),
}

/// What enforcement did for an attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enforced {
    Mounted(PathBuf),
    Blocked(BlockOutcome),
}

#[derive(Debug)]
pub struct AttachOutcome {
    pub record: DecisionRecord,
    /// Whether the record reached the history store.
    pub persisted: bool,
    pub enforcement: Result<Enforced>,
}

/// Result of [`AdmissionEngine::handle_event`].
#[derive(Debug)]
pub enum Handled {
    Attached(AttachOutcome),
    Detached(Result<UnmountOutcome>),
    Deferred { retry_at: Instant },
    Duplicate,
    Expired,
    Ignored,
}

struct Pending {
    event: HotplugEvent,
    deadline: Instant,
}

#[derive(Default)]
struct EngineState {
    /// Nodes claimed by an attach and not yet detached.
    seen: HashSet<PathBuf>,
    pending: HashMap<PathBuf, Pending>,
}

pub struct AdmissionEngine {
    state: Mutex<EngineState>,
    debounce: Duration,
    pipeline: DecisionPipeline,
    history: Arc<dyn HistoryStore>,
    gateway: Arc<EnforcementGateway>,
    activity: ActivityLoggerHandle,
    session: String,
}

/// Identifier for one engine run: process id plus start time in ms.
fn new_session_id() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis()
    )
}

impl AdmissionEngine {
    pub fn new(
        pipeline: DecisionPipeline,
        history: Arc<dyn HistoryStore>,
        gateway: Arc<EnforcementGateway>,
        activity: ActivityLoggerHandle,
        debounce: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            debounce,
            pipeline,
            history,
            gateway,
            activity,
            session: new_session_id(),
        }
    }

    /// Run identifier stamped on every decision this engine records.
    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn pipeline(&self) -> &DecisionPipeline {
        &self.pipeline
    }

    pub fn gateway(&self) -> &EnforcementGateway {
        &self.gateway
    }

    pub fn is_seen(&self, device_node: &Path) -> bool {
        self.state.lock().seen.contains(device_node)
    }

    pub fn is_pending(&self, device_node: &Path) -> bool {
        self.state.lock().pending.contains_key(device_node)
    }

    /// Earliest pending re-check deadline.
    pub fn next_recheck(&self) -> Option<Instant> {
        self.state.lock().pending.values().map(|p| p.deadline).min()
    }

    // ──────────────────── ingestion ────────────────────

    /// Update in-memory state for one raw event.
    pub fn ingest(&self, event: HotplugEvent, now: Instant) -> Ingest {
        let node = event.device_node.clone();
        let result = {
            let mut state = self.state.lock();
            match event.action {
                HotplugAction::Attach => self.ingest_attach(&mut state, event, now),
                HotplugAction::Detach => {
                    state.pending.remove(&node);
                    if state.seen.remove(&node) {
                        Ingest::Detach(node)
                    } else {
                        Ingest::Ignored(node)
                    }
                }
            }
        };
        self.log_ingest(&result, now);
        result
    }

    fn ingest_attach(&self, state: &mut EngineState, event: HotplugEvent, now: Instant) -> Ingest {
        let node = event.device_node.clone();
        if state.seen.contains(&node) {
            state.pending.remove(&node);
            return Ingest::Duplicate(node);
        }

        let merged = match state.pending.remove(&node) {
            Some(mut pending) => {
                pending.event.merge_missing(&event);
                if !pending.event.is_complete() {
                    // Keep the original deadline; re-announcements do not extend it.
                    let retry_at = pending.deadline;
                    state.pending.insert(node.clone(), pending);
                    return Ingest::Deferred {
                        device_node: node,
                        retry_at,
                    };
                }
                pending.event
            }
            None => event,
        };

        match merged.identity() {
            Some(identity) => {
                state.seen.insert(node);
                Ingest::Attach(identity)
            }
            None => {
                let retry_at = now + self.debounce;
                state.pending.insert(
                    node.clone(),
                    Pending {
                        event: merged,
                        deadline: retry_at,
                    },
                );
                Ingest::Deferred {
                    device_node: node,
                    retry_at,
                }
            }
        }
    }

    /// Fire every re-check whose deadline is at or before `now`.
    pub fn due_rechecks(&self, now: Instant) -> Vec<Ingest> {
        let results: Vec<Ingest> = {
            let mut state = self.state.lock();
            let due: Vec<PathBuf> = state
                .pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(node, _)| node.clone())
                .collect();

            due.into_iter()
                .filter_map(|node| {
                    let pending = state.pending.remove(&node)?;
                    Some(match pending.event.identity() {
                        Some(identity) if !state.seen.contains(&node) => {
                            state.seen.insert(node);
                            Ingest::Attach(identity)
                        }
                        Some(_) => Ingest::Duplicate(node),
                        None => Ingest::Expired(node),
                    })
                })
                .collect()
        };
        for r in &results {
            self.log_ingest(r, now);
        }
        results
    }

    fn log_ingest(&self, result: &Ingest, now: Instant) {
        match result {
            Ingest::Deferred {
                device_node,
                retry_at,
            } => {
                let wait = retry_at.saturating_duration_since(now);
                self.activity.send(ActivityEvent::AttachDeferred {
                    device_node: device_node.clone(),
                    retry_in_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                });
            }
            Ingest::Duplicate(node) => {
                self.activity.send(ActivityEvent::AttachSkipped {
                    device_node: node.clone(),
                    reason: "device node already handled".to_string(),
                });
            }
            Ingest::Expired(node) => {
                eprintln!(
                    "[UGK-ENGINE] {}: vendor/product never arrived; dropping attach",
                    node.display()
                );
                self.activity.send(ActivityEvent::AttachExpired {
                    device_node: node.clone(),
                });
            }
            Ingest::Ignored(node) => {
                self.activity.send(ActivityEvent::DeviceDetached {
                    device_node: node.clone(),
                    details: "ignored: node was never claimed".to_string(),
                });
            }
            Ingest::Attach(_) | Ingest::Detach(_) => {}
        }
    }

    // ──────────────────── processing ────────────────────

    /// Decide, record, enforce. Call outside any engine lock.
    pub fn process_attach(&self, identity: &DeviceIdentity) -> AttachOutcome {
        let verdict = self.pipeline.decide(identity);
        let record = DecisionRecord::new(identity, verdict.decision, verdict.source, verdict.remember)
            .in_session(&self.session);

        eprintln!(
            "[UGK-ENGINE] {identity}: {} (source={})",
            verdict.decision, verdict.source
        );
        self.activity.send(ActivityEvent::AdmissionDecided {
            identity: identity.clone(),
            decision: verdict.decision,
            source: verdict.source,
            remember: verdict.remember,
        });

        // Enforcement proceeds even when the record cannot be written.
        let persisted = match self.history.append_decision(&record) {
            Ok(()) => true,
            Err(e) => {
                eprintln!("[UGK-ENGINE] failed to record decision for {identity}: {e}");
                self.report_error(&e);
                false
            }
        };

        let enforcement = match verdict.decision {
            Decision::Allow => self.gateway.allow(identity).map(Enforced::Mounted),
            Decision::Block => self.gateway.block(identity).map(Enforced::Blocked),
        };
        self.log_enforcement(&identity.device_node, &enforcement);

        AttachOutcome {
            record,
            persisted,
            enforcement,
        }
    }

    /// Tear down whatever the latest decision for `device_node` set up.
    pub fn process_detach(&self, device_node: &Path) -> Result<UnmountOutcome> {
        let outcome = self
            .gateway
            .unmount(device_node, self.history.as_ref(), Some(&self.session));
        match &outcome {
            Ok(UnmountOutcome::Unmounted {
                mount_point,
                removed_dir,
            }) => {
                self.activity.send(ActivityEvent::EnforcementApplied {
                    device_node: device_node.to_path_buf(),
                    action: "unmount",
                    mount_point: Some(mount_point.clone()),
                    details: Some(format!("removed_dir={removed_dir}")),
                });
                self.activity.send(ActivityEvent::DeviceDetached {
                    device_node: device_node.to_path_buf(),
                    details: "unmounted".to_string(),
                });
            }
            Ok(UnmountOutcome::NotMounted) => {
                self.activity.send(ActivityEvent::DeviceDetached {
                    device_node: device_node.to_path_buf(),
                    details: "blocked device; nothing to unmount".to_string(),
                });
            }
            Err(e) => {
                eprintln!("[UGK-ENGINE] detach of {} failed: {e}", device_node.display());
                self.activity.send(ActivityEvent::EnforcementFailed {
                    device_node: device_node.to_path_buf(),
                    action: "unmount",
                    error_code: e.code().to_string(),
                    error_message: e.to_string(),
                });
            }
        }
        outcome
    }

    /// Ingest and process synchronously.
    pub fn handle_event(&self, event: HotplugEvent, now: Instant) -> Handled {
        let ingested = self.ingest(event, now);
        self.run(ingested)
    }

    /// Fire due re-checks and process them synchronously.
    pub fn run_due(&self, now: Instant) -> Vec<Handled> {
        self.due_rechecks(now)
            .into_iter()
            .map(|i| self.run(i))
            .collect()
    }

    /// Carry out the work owed by one ingestion result.
    pub fn run(&self, ingested: Ingest) -> Handled {
        match ingested {
            Ingest::Attach(identity) => Handled::Attached(self.process_attach(&identity)),
            Ingest::Detach(node) => Handled::Detached(self.process_detach(&node)),
            Ingest::Deferred { retry_at, .. } => Handled::Deferred { retry_at },
            Ingest::Duplicate(_) => Handled::Duplicate,
            Ingest::Expired(_) => Handled::Expired,
            Ingest::Ignored(_) => Handled::Ignored,
        }
    }

    fn log_enforcement(&self, device_node: &Path, enforcement: &Result<Enforced>) {
        match enforcement {
            Ok(Enforced::Mounted(target)) => {
                self.activity.send(ActivityEvent::EnforcementApplied {
                    device_node: device_node.to_path_buf(),
                    action: "mount",
                    mount_point: Some(target.clone()),
                    details: None,
                });
            }
            Ok(Enforced::Blocked(outcome)) => {
                self.activity.send(ActivityEvent::EnforcementApplied {
                    device_node: device_node.to_path_buf(),
                    action: "block_rule",
                    mount_point: None,
                    details: Some(if outcome.rule_appended {
                        format!("appended: {}", outcome.rule)
                    } else {
                        "rule already present".to_string()
                    }),
                });
            }
            Err(e) => {
                eprintln!(
                    "[UGK-ENGINE] enforcement for {} failed: {e}",
                    device_node.display()
                );
                self.activity.send(ActivityEvent::EnforcementFailed {
                    device_node: device_node.to_path_buf(),
                    action: "admission",
                    error_code: e.code().to_string(),
                    error_message: e.to_string(),
                });
            }
        }
    }

    fn report_error(&self, e: &UgkError) {
        self.activity.send(ActivityEvent::Error {
            code: e.code().to_string(),
            message: e.to_string(),
        });
    }
}
