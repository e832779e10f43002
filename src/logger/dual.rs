//! Dual-write activity logger: JSONL always, SQLite when available.
//!
//! A dedicated logger thread owns both backends. Every other thread sends
//! [`ActivityEvent`]s over a bounded crossbeam channel with `try_send()`, so
//! admission and enforcement are never blocked by logging back-pressure.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{Result, UgkError};
use crate::device::identity::DeviceIdentity;
use crate::history::record::{Decision, DecisionSource};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
#[cfg(feature = "sqlite")]
use crate::logger::sqlite::{ActivityRow, SqliteLogger};

const CHANNEL_CAPACITY: usize = 1024;

/// SQLite is disabled after this many consecutive write failures.
#[cfg(feature = "sqlite")]
const SQLITE_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone)]
pub enum ActivityEvent {
    DaemonStarted {
        version: String,
        config_hash: String,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
    },
    /// Incomplete attach parked until the debounce deadline.
    AttachDeferred {
        device_node: PathBuf,
        retry_in_ms: u64,
    },
    AttachSkipped {
        device_node: PathBuf,
        reason: String,
    },
    /// Debounce deadline passed with vendor/product still missing.
    AttachExpired {
        device_node: PathBuf,
    },
    AdmissionDecided {
        identity: DeviceIdentity,
        decision: Decision,
        source: DecisionSource,
        remember: bool,
    },
    EnforcementApplied {
        device_node: PathBuf,
        action: &'static str,
        mount_point: Option<PathBuf>,
        details: Option<String>,
    },
    EnforcementFailed {
        device_node: PathBuf,
        action: &'static str,
        error_code: String,
        error_message: String,
    },
    DeviceDetached {
        device_node: PathBuf,
        details: String,
    },
    AutomountToggled {
        enabled: bool,
    },
    ClassifierReloaded {
        loaded: bool,
    },
    Error {
        code: String,
        message: String,
    },
    /// Asks the logger thread to flush and exit.
    Shutdown,
}

/// Cloneable, non-blocking sender for activity events.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Send without blocking. A full channel drops the event and counts it.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }

    /// Handle with no logger behind it; events are discarded.
    pub fn detached() -> Self {
        let (handle, _rx) = Self::capture(1);
        handle
    }

    /// Handle whose events are delivered to the returned receiver instead of
    /// a logger thread.
    pub fn capture(capacity: usize) -> (Self, Receiver<ActivityEvent>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                dropped_events: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }
}

pub struct DualLoggerConfig {
    /// `None` disables SQLite.
    pub sqlite_path: Option<PathBuf>,
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
}

impl DualLoggerConfig {
    pub fn new(jsonl_path: PathBuf, sqlite_path: Option<PathBuf>) -> Self {
        Self {
            sqlite_path,
            jsonl_config: JsonlConfig {
                path: jsonl_path,
                ..JsonlConfig::default()
            },
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread. It runs until `shutdown()` or until every handle
/// is dropped.
pub fn spawn_logger(
    config: DualLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("ugk-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config, &dropped))
        .map_err(|e| UgkError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(
    rx: &Receiver<ActivityEvent>,
    config: DualLoggerConfig,
    dropped: &AtomicU64,
) {
    #[cfg(feature = "sqlite")]
    let mut sqlite = config
        .sqlite_path
        .and_then(|p| match SqliteLogger::open(&p) {
            Ok(db) => Some(db),
            Err(e) => {
                eprintln!("[UGK-DUAL] failed to open SQLite at {}: {e}", p.display());
                None
            }
        });
    #[cfg(not(feature = "sqlite"))]
    let _ = config.sqlite_path;
    #[cfg(feature = "sqlite")]
    let mut sqlite_failures: u32 = 0;

    let mut jsonl = JsonlWriter::open(config.jsonl_config);

    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{lost} activity events dropped (back-pressure)"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }

        let entry = to_log_entry(&event);
        jsonl.write_entry(&entry);

        #[cfg(feature = "sqlite")]
        if let Some(db) = &sqlite {
            if db.log_activity(&ActivityRow::from(&entry)).is_ok() {
                sqlite_failures = 0;
            } else {
                sqlite_failures += 1;
                if sqlite_failures >= SQLITE_FAILURE_LIMIT {
                    eprintln!("[UGK-DUAL] SQLite write failed {sqlite_failures} times, disabling");
                    sqlite = None;
                }
            }
        }
    }

    jsonl.flush();
    jsonl.fsync();
}

fn node_str(node: &std::path::Path) -> Option<String> {
    Some(node.display().to_string())
}

/// Single conversion used for both backends.
#[allow(clippy::too_many_lines)]
pub fn to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::DaemonStarted {
            version,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStart, Severity::Info);
            e.details = Some(format!("version={version} config_hash={config_hash}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::DaemonStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::AttachDeferred {
            device_node,
            retry_in_ms,
        } => {
            let mut e = LogEntry::new(EventType::AttachDeferred, Severity::Info);
            e.device_node = node_str(device_node);
            e.details = Some(format!("vendor/product missing; re-check in {retry_in_ms}ms"));
            e
        }
        ActivityEvent::AttachSkipped {
            device_node,
            reason,
        } => {
            let mut e = LogEntry::new(EventType::AttachSkipped, Severity::Info);
            e.device_node = node_str(device_node);
            e.details = Some(reason.clone());
            e
        }
        ActivityEvent::AttachExpired { device_node } => {
            let mut e = LogEntry::new(EventType::AttachExpired, Severity::Warning);
            e.device_node = node_str(device_node);
            e.details = Some("vendor/product still missing at re-check".to_string());
            e.ok = Some(false);
            e
        }
        ActivityEvent::AdmissionDecided {
            identity,
            decision,
            source,
            remember,
        } => {
            let mut e = LogEntry::new(EventType::AdmissionDecision, Severity::Info);
            e.device_node = node_str(&identity.device_node);
            e.vendor_id = Some(identity.vendor_id.clone());
            e.product_id = Some(identity.product_id.clone());
            e.serial = Some(identity.serial.clone());
            e.decision = Some(decision.to_string());
            e.source = Some(source.to_string());
            e.details = remember.then(|| "remember".to_string());
            e
        }
        ActivityEvent::EnforcementApplied {
            device_node,
            action,
            mount_point,
            details,
        } => {
            let mut e = LogEntry::new(EventType::EnforcementApplied, Severity::Info);
            e.device_node = node_str(device_node);
            e.action = Some((*action).to_string());
            e.mount_point = mount_point.as_ref().map(|p| p.display().to_string());
            e.details.clone_from(details);
            e.ok = Some(true);
            e
        }
        ActivityEvent::EnforcementFailed {
            device_node,
            action,
            error_code,
            error_message,
        } => {
            let mut e = LogEntry::new(EventType::EnforcementFailed, Severity::Warning);
            e.device_node = node_str(device_node);
            e.action = Some((*action).to_string());
            e.ok = Some(false);
            e.error_code = Some(error_code.clone());
            e.error_message = Some(error_message.clone());
            e
        }
        ActivityEvent::DeviceDetached {
            device_node,
            details,
        } => {
            let mut e = LogEntry::new(EventType::DeviceDetach, Severity::Info);
            e.device_node = node_str(device_node);
            e.details = Some(details.clone());
            e
        }
        ActivityEvent::AutomountToggled { enabled } => {
            let mut e = LogEntry::new(EventType::AutomountToggle, Severity::Info);
            e.action = Some(if *enabled { "enable" } else { "disable" }.to_string());
            e.ok = Some(true);
            e
        }
        ActivityEvent::ClassifierReloaded { loaded } => {
            let mut e = LogEntry::new(EventType::ClassifierReload, Severity::Info);
            e.details = Some(format!("model_loaded={loaded}"));
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::DaemonStop, Severity::Info),
    }
}
