//! Top-level CLI definition and dispatch.

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use usb_gatekeeper::classifier::{ClassifierAdapter, Prediction};
use usb_gatekeeper::core::config::Config;
use usb_gatekeeper::core::errors::UgkError;
use usb_gatekeeper::daemon::loop_main::{MonitorArgs, MonitorDaemon};
use usb_gatekeeper::device::identity::DeviceIdentity;
use usb_gatekeeper::device::resolver::SysfsResolver;
use usb_gatekeeper::device::source::UdevadmMonitorSource;
use usb_gatekeeper::enforce::executor::{PrivilegedExecutor, RecordingExecutor, SystemExecutor};
use usb_gatekeeper::enforce::gateway::EnforcementGateway;
use usb_gatekeeper::history::record::Decision;
use usb_gatekeeper::history::store::{FileHistoryStore, HistoryStore};
use usb_gatekeeper::logger::sqlite::SqliteLogger;

/// USB gatekeeper: decide, record and enforce admission of hotplugged USB
/// storage devices.
#[derive(Debug, Parser)]
#[command(
    name = "ugk",
    author,
    version,
    about = "USB Gatekeeper - hotplug admission controller",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the admission controller in the foreground.
    Monitor(MonitorCmdArgs),
    /// List recorded admission decisions.
    Decisions(DecisionsArgs),
    /// Show remembered allow counts per vendor.
    Counts,
    /// Clear the decision log and vendor counters.
    Reset(ResetArgs),
    /// Enable or disable desktop automount of USB storage.
    Automount(AutomountArgs),
    /// Ask the classifier about a vendor/product/serial triple.
    Predict(PredictArgs),
    /// View configuration state.
    Config(ConfigArgs),
    /// Show recent activity from the SQLite log.
    Activity(ActivityArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct MonitorCmdArgs {
    /// Print privileged commands instead of running them; history is not written.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Args)]
struct DecisionsArgs {
    /// Show only the most recent N decisions.
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Args, Default)]
struct ResetArgs {
    /// Do not ask for confirmation.
    #[arg(long, short = 'y')]
    yes: bool,
}

#[derive(Debug, Clone, Args)]
struct AutomountArgs {
    #[command(subcommand)]
    state: AutomountState,
    /// Print privileged commands instead of running them.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Copy, Subcommand, PartialEq, Eq)]
enum AutomountState {
    /// Remove the automount override.
    Enable,
    /// Install the automount override rule.
    Disable,
}

#[derive(Debug, Clone, Args)]
struct PredictArgs {
    /// Vendor id, four hex digits.
    #[arg(long)]
    vendor: String,
    /// Product id, four hex digits.
    #[arg(long)]
    product: String,
    /// Device serial.
    #[arg(long)]
    serial: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Copy, Subcommand, PartialEq, Eq)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration.
    Show,
}

#[derive(Debug, Clone, Args)]
struct ActivityArgs {
    /// Number of rows to show.
    #[arg(long, default_value_t = 20, value_name = "N")]
    limit: u32,
    /// Only rows for this device node.
    #[arg(long, value_name = "PATH")]
    device: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Library error with a stable code.
    #[error(transparent)]
    Ugk(#[from] UgkError),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) | Self::Ugk(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Monitor(args) => run_monitor(cli, args),
        Command::Decisions(args) => run_decisions(cli, args),
        Command::Counts => run_counts(cli),
        Command::Reset(args) => run_reset(cli, args),
        Command::Automount(args) => run_automount(cli, args),
        Command::Predict(args) => run_predict(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Activity(args) => run_activity(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

fn history_store(config: &Config) -> FileHistoryStore {
    FileHistoryStore::new(
        config.paths.decision_log.clone(),
        config.paths.vendor_counts.clone(),
    )
}

fn run_monitor(cli: &Cli, args: &MonitorCmdArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let monitor_args = MonitorArgs {
        dry_run: args.dry_run,
        ..MonitorArgs::default()
    };
    let mut daemon = MonitorDaemon::init(config, monitor_args)?;
    let mut source = UdevadmMonitorSource::new();
    daemon.run(&mut source)?;
    Ok(())
}

fn run_decisions(cli: &Cli, args: &DecisionsArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let mut records = history_store(&config).decisions();
    if let Some(limit) = args.limit {
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
    }

    match output_mode(cli) {
        OutputMode::Human => {
            if records.is_empty() {
                println!("No decisions recorded.");
            }
            for r in &records {
                let decision = match r.decision {
                    Decision::Allow => "allow".green(),
                    Decision::Block => "block".red(),
                };
                println!(
                    "{}  {decision:<5}  {}:{}  serial={}  node={}  source={}{}",
                    r.timestamp,
                    r.vendor_id,
                    r.product_id,
                    r.serial,
                    r.device_node.display(),
                    r.source,
                    if r.remember { " (remembered)" } else { "" },
                );
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "decisions",
                "decisions": serde_json::to_value(&records)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_counts(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let counts = history_store(&config).vendor_allow_counts();
    let threshold = config.engine.auto_allow_threshold;

    match output_mode(cli) {
        OutputMode::Human => {
            if counts.is_empty() {
                println!("No remembered allows.");
            }
            for (vendor, count) in &counts {
                let marker = if *count >= threshold {
                    "auto-allow".green().to_string()
                } else {
                    format!("{count}/{threshold}")
                };
                println!("{vendor}  {count:>4}  {marker}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "counts",
                "threshold": threshold,
                "counts": counts,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_reset(cli: &Cli, args: &ResetArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = history_store(&config);

    if !args.yes {
        if !io::stdin().is_terminal() {
            return Err(CliError::User(
                "refusing to reset history without --yes on a non-interactive stdin".to_string(),
            ));
        }
        print!(
            "Clear {} and {}? [y/N] ",
            store.decision_log_path().display(),
            store.vendor_counts_path().display()
        );
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        if !confirmed(&answer) {
            println!("Aborted.");
            return Ok(());
        }
    }

    store.reset()?;
    match output_mode(cli) {
        OutputMode::Human => println!("History cleared."),
        OutputMode::Json => write_json_line(&json!({"command": "reset", "cleared": true}))?,
    }
    Ok(())
}

fn confirmed(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn run_automount(cli: &Cli, args: &AutomountArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let executor: Arc<dyn PrivilegedExecutor> = if args.dry_run {
        Arc::new(RecordingExecutor::new().echoing())
    } else {
        Arc::new(SystemExecutor::new(config.enforcement.use_sudo))
    };
    let resolver = Arc::new(SysfsResolver::new(
        config.enforcement.sysfs_root.clone(),
        config.enforcement.dev_root.clone(),
    ));
    let gateway = EnforcementGateway::new(&config.enforcement, executor, resolver);
    let enabled = args.state == AutomountState::Enable;
    gateway.set_automount(enabled)?;

    match output_mode(cli) {
        OutputMode::Human => println!(
            "Automount {}.",
            if enabled { "enabled" } else { "disabled" }
        ),
        OutputMode::Json => write_json_line(&json!({
            "command": "automount",
            "enabled": enabled,
            "dry_run": args.dry_run,
        }))?,
    }
    Ok(())
}

fn run_predict(cli: &Cli, args: &PredictArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let identity = DeviceIdentity::new(
        args.vendor.as_str(),
        args.product.as_str(),
        args.serial.as_deref(),
        "",
    );
    if !identity.has_valid_ids() {
        return Err(CliError::User(format!(
            "vendor and product must be four hex digits (got {}:{})",
            args.vendor, args.product
        )));
    }

    let adapter = ClassifierAdapter::from_config(&config.classifier);
    let prediction = adapter.predict(&identity);
    let label = match prediction {
        Prediction::Allow => "allow",
        Prediction::Unknown => "unknown",
    };

    match output_mode(cli) {
        OutputMode::Human => {
            if !adapter.is_loaded() {
                eprintln!("note: no classifier model loaded; every device is unknown");
            }
            println!("{label}");
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "predict",
            "vendor_id": identity.vendor_id,
            "product_id": identity.product_id,
            "serial": identity.serial,
            "model_loaded": adapter.is_loaded(),
            "prediction": label,
        }))?,
    }
    Ok(())
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;
            let hash = config.stable_hash()?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("# hash: {hash}");
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "hash": hash,
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
    }
}

fn run_activity(cli: &Cli, args: &ActivityArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let db_path = &config.paths.sqlite_db;
    if !db_path.exists() {
        return Err(CliError::Runtime(format!(
            "no activity database at {}",
            db_path.display()
        )));
    }
    let db = SqliteLogger::open(db_path)?;
    let rows = match &args.device {
        Some(node) => db.device_activity(node, args.limit)?,
        None => db.recent_activity(args.limit)?,
    };

    match output_mode(cli) {
        OutputMode::Human => {
            for row in &rows {
                let status = if row.success == 0 {
                    "FAIL".red()
                } else {
                    "ok".normal()
                };
                let subject = row
                    .device_node
                    .as_deref()
                    .or(row.details.as_deref())
                    .unwrap_or("-");
                println!(
                    "{}  {:<20} {:<4} {subject}{}",
                    row.timestamp,
                    row.event_type,
                    status,
                    row.decision
                        .as_deref()
                        .map(|d| format!("  decision={d}"))
                        .unwrap_or_default(),
                );
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "activity",
                "rows": serde_json::to_value(&rows)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("UGK_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
