//! Monitor loop: hotplug source → admission engine → worker pool.
//!
//! Threading model:
//! ```text
//! ┌─────────────────┐  bounded   ┌──────────────┐  per-node FIFOs  ┌──────────────┐
//! │ hotplug source  │ ─────────▶ │  main loop   │ ───────────────▶ │ ugk-worker-N │
//! │ (udevadm thread)│  channel   │ ingest/timer │   shared queue   │ decide+apply │
//! └─────────────────┘            └──────────────┘                  └──────────────┘
//!                                       │ signals, reload, debounce deadlines
//! ```
//!
//! Ingestion stays on the main loop so claims and debounce state are updated
//! in event order. Pipeline work (which may block on a prompt) runs on
//! workers. A node has at most one job in flight, so a detach is never
//! processed before the attach it follows, while other nodes keep moving.

#![allow(missing_docs)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use parking_lot::{Condvar, Mutex};

use crate::classifier::ClassifierAdapter;
use crate::core::config::Config;
use crate::core::errors::{Result, UgkError};
use crate::daemon::signals::{ShutdownCoordinator, SignalHandler};
use crate::device::identity::HotplugEvent;
use crate::device::resolver::{BlockDeviceResolver, SysfsResolver};
use crate::device::source::HotplugSource;
use crate::enforce::executor::{PrivilegedExecutor, RecordingExecutor, SystemExecutor};
use crate::enforce::gateway::EnforcementGateway;
use crate::engine::admission::{AdmissionEngine, Ingest};
use crate::engine::pipeline::DecisionPipeline;
use crate::engine::prompt::{self, Prompter};
use crate::history::store::{FileHistoryStore, HistoryStore, MemoryHistoryStore};
use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle, DualLoggerConfig, spawn_logger};

/// Longest the loop blocks before re-checking signal flags.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

// ──────────────────── thread restart tracking ────────────────────

const MAX_RESPAWNS: u32 = 3;
const RESPAWN_WINDOW: Duration = Duration::from_secs(300);

/// Sliding-window restart budget for a supervised thread or source.
struct RestartBudget {
    limit: u32,
    window: Duration,
    restarts: Vec<Instant>,
}

impl RestartBudget {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            restarts: Vec::new(),
        }
    }

    /// Record a restart at `now`. Returns false once the limit is exceeded.
    fn try_restart(&mut self, now: Instant) -> bool {
        let window = self.window;
        self.restarts.retain(|t| now.duration_since(*t) < window);
        if self.restarts.len() >= self.limit as usize {
            return false;
        }
        self.restarts.push(now);
        true
    }
}

// ──────────────────── worker pool ────────────────────

#[derive(Default)]
struct QueueState {
    /// Nodes with queued work and nothing in flight, oldest first.
    ready: VecDeque<PathBuf>,
    pending: HashMap<PathBuf, VecDeque<Ingest>>,
    in_flight: HashSet<PathBuf>,
    closed: bool,
}

impl QueueState {
    fn pop_ready(&mut self) -> Option<(PathBuf, Ingest)> {
        while let Some(node) = self.ready.pop_front() {
            let Some(jobs) = self.pending.get_mut(&node) else {
                continue;
            };
            let Some(job) = jobs.pop_front() else {
                self.pending.remove(&node);
                continue;
            };
            if jobs.is_empty() {
                self.pending.remove(&node);
            }
            self.in_flight.insert(node.clone());
            return Some((node, job));
        }
        None
    }
}

/// Shared job queue: one FIFO per device node, at most one job per node in
/// flight. Any idle worker takes the oldest ready node, so a node waiting on
/// a prompt holds up only its own later jobs.
#[derive(Default)]
struct JobQueue {
    state: Mutex<QueueState>,
    ready_cv: Condvar,
}

/// A job's node stays in flight until its claim drops, including on unwind.
struct Claim<'a> {
    queue: &'a JobQueue,
    node: PathBuf,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.queue.finish(&self.node);
    }
}

impl JobQueue {
    fn push(&self, node: PathBuf, job: Ingest) {
        let mut state = self.state.lock();
        let queue = state.pending.entry(node.clone()).or_default();
        queue.push_back(job);
        let first = queue.len() == 1;
        if first && !state.in_flight.contains(&node) {
            state.ready.push_back(node);
            drop(state);
            self.ready_cv.notify_one();
        }
    }

    /// Block until a node is ready. `None` once closed and nothing is ready.
    fn take(&self) -> Option<(Claim<'_>, Ingest)> {
        let mut state = self.state.lock();
        loop {
            if let Some((node, job)) = state.pop_ready() {
                return Some((Claim { queue: self, node }, job));
            }
            if state.closed {
                return None;
            }
            self.ready_cv.wait(&mut state);
        }
    }

    fn finish(&self, node: &Path) {
        let mut state = self.state.lock();
        state.in_flight.remove(node);
        if state.pending.contains_key(node) {
            state.ready.push_back(node.to_path_buf());
            drop(state);
            self.ready_cv.notify_one();
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.ready_cv.notify_all();
    }

    fn queued(&self) -> usize {
        self.state.lock().pending.values().map(VecDeque::len).sum()
    }
}

struct WorkerPool {
    engine: Arc<AdmissionEngine>,
    queue: Arc<JobQueue>,
    workers: Vec<thread::JoinHandle<()>>,
    health: Vec<RestartBudget>,
}

impl WorkerPool {
    fn spawn(count: usize, engine: &Arc<AdmissionEngine>) -> Result<Self> {
        let count = count.max(1);
        let mut pool = Self {
            engine: Arc::clone(engine),
            queue: Arc::new(JobQueue::default()),
            workers: Vec::with_capacity(count),
            health: (0..count)
                .map(|_| RestartBudget::new(MAX_RESPAWNS, RESPAWN_WINDOW))
                .collect(),
        };
        for idx in 0..count {
            let worker = pool.spawn_worker(idx)?;
            pool.workers.push(worker);
        }
        Ok(pool)
    }

    fn spawn_worker(&self, idx: usize) -> Result<thread::JoinHandle<()>> {
        let engine = Arc::clone(&self.engine);
        let queue = Arc::clone(&self.queue);
        thread::Builder::new()
            .name(format!("ugk-worker-{idx}"))
            .spawn(move || worker_main(&engine, &queue))
            .map_err(|e| UgkError::Runtime {
                details: format!("failed to spawn worker thread: {e}"),
            })
    }

    /// Queue slow work behind earlier jobs for the same node. Bookkeeping
    /// results are dropped here; the engine already logged them.
    fn dispatch(&mut self, ingested: Ingest) {
        let node = match &ingested {
            Ingest::Attach(identity) => identity.device_node.clone(),
            Ingest::Detach(node) => node.clone(),
            Ingest::Deferred { .. }
            | Ingest::Duplicate(_)
            | Ingest::Expired(_)
            | Ingest::Ignored(_) => return,
        };
        self.respawn_dead();
        self.queue.push(node, ingested);
    }

    fn respawn_dead(&mut self) {
        for idx in 0..self.workers.len() {
            if !self.workers[idx].is_finished() {
                continue;
            }
            if !self.health[idx].try_restart(Instant::now()) {
                continue;
            }
            eprintln!("[UGK-DAEMON] worker {idx} died; respawning");
            match self.spawn_worker(idx) {
                Ok(worker) => {
                    let dead = std::mem::replace(&mut self.workers[idx], worker);
                    let _ = dead.join();
                }
                Err(e) => eprintln!("[UGK-DAEMON] worker {idx} respawn failed: {e}"),
            }
        }
        if self.workers.iter().all(thread::JoinHandle::is_finished) {
            eprintln!(
                "[UGK-DAEMON] no live workers; {} queued jobs waiting",
                self.queue.queued()
            );
        }
    }

    /// Close the queue and wait for queued jobs to finish.
    fn drain(self) -> bool {
        self.queue.close();
        self.workers.into_iter().all(|j| j.join().is_ok())
    }
}

fn worker_main(engine: &AdmissionEngine, queue: &JobQueue) {
    while let Some((_claim, job)) = queue.take() {
        engine.run(job);
    }
}

// ──────────────────── daemon ────────────────────

#[derive(Debug, Clone)]
pub struct MonitorArgs {
    /// Print privileged commands instead of running them; keep history in memory.
    pub dry_run: bool,
    /// Times the event source may be restarted within five minutes.
    pub max_source_restarts: u32,
}

impl Default for MonitorArgs {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_source_restarts: MAX_RESPAWNS,
        }
    }
}

/// Collaborators the monitor wires into the engine.
pub struct DaemonParts {
    pub history: Arc<dyn HistoryStore>,
    pub classifier: Arc<ClassifierAdapter>,
    pub prompter: Arc<dyn Prompter>,
    pub executor: Arc<dyn PrivilegedExecutor>,
    pub resolver: Arc<dyn BlockDeviceResolver>,
}

impl DaemonParts {
    /// Production collaborators for `config`.
    pub fn from_config(config: &Config, dry_run: bool) -> Self {
        let history: Arc<dyn HistoryStore> = if dry_run {
            Arc::new(MemoryHistoryStore::new())
        } else {
            Arc::new(FileHistoryStore::new(
                config.paths.decision_log.clone(),
                config.paths.vendor_counts.clone(),
            ))
        };
        let executor: Arc<dyn PrivilegedExecutor> = if dry_run {
            Arc::new(RecordingExecutor::new().echoing())
        } else {
            Arc::new(SystemExecutor::new(config.enforcement.use_sudo))
        };
        Self {
            history,
            classifier: Arc::new(ClassifierAdapter::from_config(&config.classifier)),
            prompter: Arc::from(prompt::from_config(&config.prompt)),
            executor,
            resolver: Arc::new(SysfsResolver::new(
                config.enforcement.sysfs_root.clone(),
                config.enforcement.dev_root.clone(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Signal,
    SourceEnded,
    SourceFailed,
}

impl StopReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::SourceEnded => "event source ended",
            Self::SourceFailed => "event source failed",
        }
    }
}

pub struct MonitorDaemon {
    config: Config,
    args: MonitorArgs,
    engine: Arc<AdmissionEngine>,
    classifier: Arc<ClassifierAdapter>,
    gateway: Arc<EnforcementGateway>,
    logger_handle: ActivityLoggerHandle,
    logger_join: Option<thread::JoinHandle<()>>,
    signal_handler: SignalHandler,
    start_time: Instant,
}

impl MonitorDaemon {
    /// Start the activity logger, register signal hooks and build the
    /// production engine.
    pub fn init(config: Config, args: MonitorArgs) -> Result<Self> {
        let (logger_handle, logger_join) = spawn_logger(DualLoggerConfig::new(
            config.paths.jsonl_log.clone(),
            Some(config.paths.sqlite_db.clone()),
        ))?;
        let parts = DaemonParts::from_config(&config, args.dry_run);
        let mut daemon = Self::with_parts(config, args, parts, logger_handle, SignalHandler::new());
        daemon.logger_join = Some(logger_join);
        Ok(daemon)
    }

    /// Assemble a daemon from explicit collaborators. The caller owns the
    /// logger behind `logger_handle`, if any.
    pub fn with_parts(
        config: Config,
        args: MonitorArgs,
        parts: DaemonParts,
        logger_handle: ActivityLoggerHandle,
        signal_handler: SignalHandler,
    ) -> Self {
        let gateway = Arc::new(EnforcementGateway::new(
            &config.enforcement,
            parts.executor,
            parts.resolver,
        ));
        let pipeline = DecisionPipeline::new(
            Arc::clone(&parts.history),
            Arc::clone(&parts.classifier),
            parts.prompter,
            config.engine.auto_allow_threshold,
        );
        let engine = Arc::new(AdmissionEngine::new(
            pipeline,
            parts.history,
            Arc::clone(&gateway),
            logger_handle.clone(),
            Duration::from_millis(config.engine.debounce_ms),
        ));
        Self {
            config,
            args,
            engine,
            classifier: parts.classifier,
            gateway,
            logger_handle,
            logger_join: None,
            signal_handler,
            start_time: Instant::now(),
        }
    }

    pub fn signal_handler(&self) -> &SignalHandler {
        &self.signal_handler
    }

    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }

    /// Run until a shutdown signal or until `source` ends for good.
    pub fn run(&mut self, source: &mut dyn HotplugSource) -> Result<()> {
        let config_hash = self
            .config
            .stable_hash()
            .unwrap_or_else(|_| "unknown".to_string());
        self.logger_handle.send(ActivityEvent::DaemonStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash,
        });
        eprintln!(
            "[UGK-DAEMON] started: source={} workers={} debounce={}ms dry_run={}",
            source.name(),
            self.config.engine.workers.max(1),
            self.config.engine.debounce_ms,
            self.args.dry_run,
        );

        if self.config.enforcement.manage_automount {
            self.set_automount(false);
        }

        let workers = match WorkerPool::spawn(self.config.engine.workers, &self.engine) {
            Ok(pool) => pool,
            Err(e) => {
                self.shutdown(source, None, StopReason::SourceFailed);
                return Err(e);
            }
        };

        let (tx, rx) = bounded(self.channel_capacity());
        if let Err(e) = source.start(tx) {
            eprintln!("[UGK-DAEMON] failed to start {}: {e}", source.name());
            self.report_error(&e);
            self.shutdown(source, Some(workers), StopReason::SourceFailed);
            return Err(e);
        }

        let mut workers = workers;
        let reason = self.event_loop(source, rx, &mut workers);
        self.shutdown(source, Some(workers), reason);
        Ok(())
    }

    fn channel_capacity(&self) -> usize {
        self.config.engine.event_channel_capacity.max(1)
    }

    fn event_loop(
        &self,
        source: &mut dyn HotplugSource,
        mut rx: Receiver<HotplugEvent>,
        workers: &mut WorkerPool,
    ) -> StopReason {
        let mut budget = RestartBudget::new(self.args.max_source_restarts, RESPAWN_WINDOW);
        let mut source_done: Option<StopReason> = None;

        loop {
            if self.signal_handler.should_shutdown() {
                return StopReason::Signal;
            }
            if self.signal_handler.should_reload() {
                self.reload_classifier();
            }

            let now = Instant::now();
            let next = self.engine.next_recheck();
            if let Some(reason) = source_done
                && next.is_none()
            {
                return reason;
            }
            let wait = next.map_or(POLL_INTERVAL, |at| {
                at.saturating_duration_since(now).min(POLL_INTERVAL)
            });

            if source_done.is_some() {
                // Source gone; only pending debounce deadlines remain.
                thread::sleep(wait);
            } else {
                match rx.recv_timeout(wait) {
                    Ok(event) => workers.dispatch(self.engine.ingest(event, Instant::now())),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        match self.restart_source(source, &mut budget) {
                            Ok(new_rx) => rx = new_rx,
                            Err(reason) => source_done = Some(reason),
                        }
                    }
                }
            }

            for due in self.engine.due_rechecks(Instant::now()) {
                workers.dispatch(due);
            }
        }
    }

    fn restart_source(
        &self,
        source: &mut dyn HotplugSource,
        budget: &mut RestartBudget,
    ) -> std::result::Result<Receiver<HotplugEvent>, StopReason> {
        source.stop();
        if !budget.try_restart(Instant::now()) {
            eprintln!(
                "[UGK-DAEMON] event source {} ended; restart budget exhausted",
                source.name()
            );
            return Err(StopReason::SourceEnded);
        }
        eprintln!("[UGK-DAEMON] event source {} ended; restarting", source.name());
        let (tx, rx) = bounded(self.channel_capacity());
        match source.start(tx) {
            Ok(()) => Ok(rx),
            Err(e) => {
                eprintln!("[UGK-DAEMON] restart of {} failed: {e}", source.name());
                self.report_error(&e);
                Err(StopReason::SourceFailed)
            }
        }
    }

    fn reload_classifier(&self) {
        let loaded = self.classifier.reload();
        eprintln!("[UGK-DAEMON] classifier reload requested: loaded={loaded}");
        self.logger_handle
            .send(ActivityEvent::ClassifierReloaded { loaded });
    }

    fn set_automount(&self, enabled: bool) -> bool {
        match self.gateway.set_automount(enabled) {
            Ok(()) => {
                self.logger_handle
                    .send(ActivityEvent::AutomountToggled { enabled });
                true
            }
            Err(e) => {
                eprintln!("[UGK-DAEMON] failed to set automount={enabled}: {e}");
                self.report_error(&e);
                false
            }
        }
    }

    fn report_error(&self, e: &UgkError) {
        self.logger_handle.send(ActivityEvent::Error {
            code: e.code().to_string(),
            message: e.to_string(),
        });
    }

    fn shutdown(
        &mut self,
        source: &mut dyn HotplugSource,
        workers: Option<WorkerPool>,
        reason: StopReason,
    ) {
        eprintln!("[UGK-DAEMON] shutting down ({})", reason.as_str());
        let source = RefCell::new(source);
        let workers = RefCell::new(workers);
        let manage_automount = self.config.enforcement.manage_automount;

        let stop_source = || {
            source.borrow_mut().stop();
            true
        };
        let drain_workers = || workers.borrow_mut().take().is_none_or(WorkerPool::drain);
        let restore_automount = || !manage_automount || self.set_automount(true);

        let tasks: Vec<(&str, &dyn Fn() -> bool)> = vec![
            ("stop event source", &stop_source),
            ("drain workers", &drain_workers),
            ("restore automount", &restore_automount),
        ];
        ShutdownCoordinator::new().execute(&tasks);

        let uptime = self.start_time.elapsed().as_secs();
        self.logger_handle.send(ActivityEvent::DaemonStopped {
            reason: reason.as_str().to_string(),
            uptime_secs: uptime,
        });
        let dropped = self.logger_handle.dropped_events();
        if dropped > 0 {
            eprintln!("[UGK-DAEMON] {dropped} activity events were dropped");
        }
        self.logger_handle.shutdown();
        if let Some(join) = self.logger_join.take() {
            let _ = join.join();
        }
        eprintln!("[UGK-DAEMON] shutdown complete (uptime {uptime}s)");
    }
}
