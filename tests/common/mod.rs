#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use usb_gatekeeper::classifier::{ClassifierAdapter, Prediction, Predictor};
use usb_gatekeeper::core::config::{Config, PromptMode};
use usb_gatekeeper::core::errors::{Result, UgkError};
use usb_gatekeeper::device::identity::DeviceIdentity;
use usb_gatekeeper::device::resolver::{BlockDeviceResolver, StaticResolver};
use usb_gatekeeper::enforce::executor::RecordingExecutor;
use usb_gatekeeper::enforce::gateway::EnforcementGateway;
use usb_gatekeeper::engine::admission::AdmissionEngine;
use usb_gatekeeper::engine::pipeline::DecisionPipeline;
use usb_gatekeeper::engine::prompt::{PromptReply, Prompter};
use usb_gatekeeper::history::store::FileHistoryStore;
use usb_gatekeeper::logger::dual::{ActivityEvent, ActivityLoggerHandle};

// ──────────────────── CLI runner ────────────────────

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_ugk") {
        return PathBuf::from(path);
    }

    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join("ugk"));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve ugk binary path for integration test"),
    }
}

/// Run `ugk` with `HOME` pointed at `home`, so every default path lands in
/// the scratch directory. Output is kept in a per-case log for triage.
pub fn run_cli_case(case_name: &str, home: &Path, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("ugk-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("HOME", home)
        .env_remove("UGK_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute ugk command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let log_content = format!(
        "case={case_name}\nbin={}\nargs={args:?}\nstatus={}\n----- stdout -----\n{stdout}\n----- stderr -----\n{stderr}\n",
        bin_path.display(),
        output.status,
    );
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

// ──────────────────── fakes ────────────────────

/// Prompter answering from a script. An exhausted script or a `None` entry
/// is a prompt failure.
#[derive(Default)]
pub struct ScriptedPrompter {
    replies: Mutex<VecDeque<Option<PromptReply>>>,
    calls: AtomicUsize,
}

impl ScriptedPrompter {
    pub fn new(replies: impl IntoIterator<Item = Option<PromptReply>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn repeating(reply: PromptReply, times: usize) -> Self {
        Self::new(std::iter::repeat_n(Some(reply), times))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Prompter for ScriptedPrompter {
    fn prompt(&self, _identity: &DeviceIdentity) -> Result<PromptReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .pop_front()
            .flatten()
            .ok_or_else(|| UgkError::Prompt {
                details: "scripted prompt exhausted".to_string(),
            })
    }
}

/// Predictor with a fixed answer that counts calls.
pub struct FixedPredictor {
    pub answer: Prediction,
    calls: AtomicUsize,
}

impl FixedPredictor {
    pub fn new(answer: Prediction) -> Self {
        Self {
            answer,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Predictor for FixedPredictor {
    fn predict(&self, _identity: &DeviceIdentity) -> Prediction {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

/// Builds a minimal sysfs tree: USB device dirs with `busnum`/`devnum`,
/// a disk and partition beneath each, and the `bus/usb/devices` and
/// `class/block` symlinks pointing at them.
#[cfg(unix)]
pub struct FakeSysfs {
    root: PathBuf,
}

#[cfg(unix)]
impl FakeSysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        fs::create_dir_all(root.join("bus/usb/devices")).expect("create bus/usb/devices");
        fs::create_dir_all(root.join("class/block")).expect("create class/block");
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Add USB device `bus`/`dev` whose first partition is `<disk>1`.
    pub fn usb_storage(&self, bus: u32, dev: u32, disk: &str) -> &Self {
        use std::os::unix::fs::symlink;

        let name = format!("{bus}-{dev}");
        let usb = self.root.join("devices/pci0000:00").join(format!("usb{bus}")).join(&name);
        fs::create_dir_all(&usb).expect("create usb dir");
        fs::write(usb.join("busnum"), format!("{bus}\n")).expect("write busnum");
        fs::write(usb.join("devnum"), format!("{dev}\n")).expect("write devnum");

        let disk_dir = usb
            .join(format!("{name}:1.0/host0/target0:0:0/0:0:0:0/block"))
            .join(disk);
        let part_name = format!("{disk}1");
        let part = disk_dir.join(&part_name);
        fs::create_dir_all(&part).expect("create partition dir");
        fs::write(part.join("partition"), "1\n").expect("write partition");

        symlink(&usb, self.root.join("bus/usb/devices").join(&name)).expect("link usb device");
        symlink(&disk_dir, self.root.join("class/block").join(disk)).expect("link disk");
        symlink(&part, self.root.join("class/block").join(part_name)).expect("link partition");
        self
    }
}

// ──────────────────── engine harness ────────────────────

pub const MEDIA_USER: &str = "alice";

/// Config rooted in a scratch directory; prompting disabled, classifier off.
pub fn scratch_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.engine.debounce_ms = 50;
    config.prompt.mode = PromptMode::Deny;
    config.classifier.enabled = false;
    config.enforcement.media_root = dir.join("media");
    config.enforcement.mount_user = Some(MEDIA_USER.to_string());
    config.enforcement.automount_rules_file = dir.join("rules/99-disable-usb-automount.rules");
    config.enforcement.block_rules_file = dir.join("rules/99-usb-blacklist.rules");
    config.enforcement.use_sudo = false;
    config.paths.decision_log = dir.join("data/decisions.json");
    config.paths.vendor_counts = dir.join("data/vendor_allow_counts.json");
    config.paths.jsonl_log = dir.join("data/activity.jsonl");
    config.paths.sqlite_db = dir.join("data/activity.sqlite3");
    fs::create_dir_all(dir.join("rules")).expect("create rules dir");
    config
}

/// One engine wired to file-backed history, a recording executor that
/// applies filesystem effects locally, and scripted human answers.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: Config,
    pub history: Arc<FileHistoryStore>,
    pub exec: Arc<RecordingExecutor>,
    pub prompter: Arc<ScriptedPrompter>,
    pub predictor: Arc<FixedPredictor>,
    pub engine: AdmissionEngine,
    pub activity: crossbeam_channel::Receiver<ActivityEvent>,
}

impl Harness {
    pub fn new(prompter: ScriptedPrompter, resolver: Arc<dyn BlockDeviceResolver>) -> Self {
        Self::with_predictor(prompter, Prediction::Unknown, resolver)
    }

    pub fn with_predictor(
        prompter: ScriptedPrompter,
        prediction: Prediction,
        resolver: Arc<dyn BlockDeviceResolver>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = scratch_config(dir.path());
        let history = Arc::new(FileHistoryStore::new(
            config.paths.decision_log.clone(),
            config.paths.vendor_counts.clone(),
        ));
        let exec = Arc::new(RecordingExecutor::new().with_filesystem());
        let prompter = Arc::new(prompter);
        let predictor = Arc::new(FixedPredictor::new(prediction));
        let gateway = Arc::new(EnforcementGateway::new(
            &config.enforcement,
            exec.clone(),
            resolver,
        ));
        let pipeline = DecisionPipeline::new(
            history.clone(),
            Arc::new(ClassifierAdapter::with_predictor(predictor.clone())),
            prompter.clone(),
            config.engine.auto_allow_threshold,
        );
        let (logger, activity) = ActivityLoggerHandle::capture(1024);
        let engine = AdmissionEngine::new(
            pipeline,
            history.clone(),
            gateway,
            logger,
            Duration::from_millis(config.engine.debounce_ms),
        );
        Self {
            dir,
            config,
            history,
            exec,
            prompter,
            predictor,
            engine,
            activity,
        }
    }

    pub fn mount_point(&self, serial: &str) -> PathBuf {
        self.config
            .enforcement
            .media_root
            .join(MEDIA_USER)
            .join(serial)
    }

    pub fn block_rules(&self) -> String {
        fs::read_to_string(&self.config.enforcement.block_rules_file).unwrap_or_default()
    }

    pub fn drain_activity(&self) -> Vec<ActivityEvent> {
        self.activity.try_iter().collect()
    }
}

/// Resolver mapping each node to itself, for scenarios that name partitions
/// directly.
pub fn identity_resolver(nodes: &[&str]) -> Arc<dyn BlockDeviceResolver> {
    Arc::new(
        nodes
            .iter()
            .fold(StaticResolver::new(), |r, node| r.with(*node, *node)),
    )
}
