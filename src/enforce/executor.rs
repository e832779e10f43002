//! Privileged executor: the only path to root-level OS commands.
//!
//! Callers build a [`PrivilegedCommand`] from a closed vocabulary; nothing
//! else can be run. Arguments are passed as argv entries, never through a
//! shell, so paths and rule text are not reinterpreted.

#![allow(missing_docs)]

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use parking_lot::Mutex;

use crate::core::errors::{Result, UgkError};

/// Fixed command vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivilegedCommand {
    /// `mkdir -p <path>`
    Mkdir { path: PathBuf },
    /// `mount <device> <target>`
    Mount { device: PathBuf, target: PathBuf },
    /// `umount <target>`
    Umount { target: PathBuf },
    /// `rmdir <path>`
    RemoveDir { path: PathBuf },
    /// `tee -a <path>`, payload on stdin.
    TeeAppend { path: PathBuf },
    /// `tee <path>` (truncate), payload on stdin.
    TeeWrite { path: PathBuf },
    /// `udevadm control --reload`
    RuleReload,
    /// `udevadm trigger`
    RuleTrigger,
}

impl PrivilegedCommand {
    pub fn argv(&self) -> Vec<String> {
        let path = |p: &PathBuf| p.to_string_lossy().into_owned();
        match self {
            Self::Mkdir { path: p } => vec!["mkdir".into(), "-p".into(), path(p)],
            Self::Mount { device, target } => vec!["mount".into(), path(device), path(target)],
            Self::Umount { target } => vec!["umount".into(), path(target)],
            Self::RemoveDir { path: p } => vec!["rmdir".into(), path(p)],
            Self::TeeAppend { path: p } => vec!["tee".into(), "-a".into(), path(p)],
            Self::TeeWrite { path: p } => vec!["tee".into(), path(p)],
            Self::RuleReload => vec!["udevadm".into(), "control".into(), "--reload".into()],
            Self::RuleTrigger => vec!["udevadm".into(), "trigger".into()],
        }
    }

    /// Whether the command reads a payload from stdin.
    pub const fn takes_input(&self) -> bool {
        matches!(self, Self::TeeAppend { .. } | Self::TeeWrite { .. })
    }
}

impl fmt::Display for PrivilegedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Capability interface for privileged actions.
pub trait PrivilegedExecutor: Send + Sync {
    fn execute(&self, cmd: &PrivilegedCommand) -> Result<()>;
    fn execute_with_input(&self, cmd: &PrivilegedCommand, input: &str) -> Result<()>;
}

// ──────────────────── system executor ────────────────────

/// Runs commands directly, or through `sudo -n` when not root.
///
/// `-n` makes sudo fail instead of prompting; the daemon never holds a
/// password.
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    use_sudo: bool,
}

impl SystemExecutor {
    pub const fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    fn command(&self, cmd: &PrivilegedCommand) -> Command {
        let argv = cmd.argv();
        let mut command = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").args(&argv);
            c
        } else {
            let mut c = Command::new(&argv[0]);
            c.args(&argv[1..]);
            c
        };
        // tee echoes its input; keep it off our stdout.
        command.stdout(Stdio::null()).stderr(Stdio::piped());
        command
    }

    fn check(cmd: &PrivilegedCommand, output: &std::process::Output) -> Result<()> {
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(UgkError::Execution {
            command: cmd.to_string(),
            details: format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ),
        })
    }

    fn program(&self) -> &'static str {
        if self.use_sudo { "sudo" } else { "privileged command" }
    }
}

impl PrivilegedExecutor for SystemExecutor {
    fn execute(&self, cmd: &PrivilegedCommand) -> Result<()> {
        let output = self
            .command(cmd)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| UgkError::Execution {
                command: cmd.to_string(),
                details: format!("{} failed to start: {e}", self.program()),
            })?;
        Self::check(cmd, &output)
    }

    fn execute_with_input(&self, cmd: &PrivilegedCommand, input: &str) -> Result<()> {
        let mut child = self
            .command(cmd)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| UgkError::Execution {
                command: cmd.to_string(),
                details: format!("{} failed to start: {e}", self.program()),
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| UgkError::Execution {
                    command: cmd.to_string(),
                    details: format!("writing stdin: {e}"),
                })?;
        }
        let output = child.wait_with_output().map_err(|e| UgkError::Execution {
            command: cmd.to_string(),
            details: format!("waiting for exit: {e}"),
        })?;
        Self::check(cmd, &output)
    }
}

// ──────────────────── recording executor ────────────────────

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
    pub command: PrivilegedCommand,
    pub input: Option<String>,
}

/// Records commands instead of running them.
///
/// Used for `--dry-run` and in tests. With [`Self::with_filesystem`] the
/// directory and `tee` commands are applied to the local filesystem (without
/// privilege), so callers that inspect the filesystem see a consistent state.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    log: Mutex<Vec<ExecutedCommand>>,
    apply_filesystem: bool,
    echo: bool,
    failing: Mutex<Vec<&'static str>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_filesystem(mut self) -> Self {
        self.apply_filesystem = true;
        self
    }

    /// Print each command to stderr as it is recorded.
    #[must_use]
    pub fn echoing(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Make every command whose program is `program` fail.
    pub fn fail_program(&self, program: &'static str) {
        self.failing.lock().push(program);
    }

    pub fn commands(&self) -> Vec<ExecutedCommand> {
        self.log.lock().clone()
    }

    /// Recorded argv lines, e.g. `"umount /media/alice/ABC"`.
    pub fn lines(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .map(|c| c.command.to_string())
            .collect()
    }

    pub fn count_program(&self, program: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|c| c.command.argv()[0] == program)
            .count()
    }

    fn record(&self, cmd: &PrivilegedCommand, input: Option<&str>) -> Result<()> {
        if self.echo {
            match input {
                Some(payload) => eprintln!("[UGK-DRYRUN] {cmd} <<< {}", payload.trim_end()),
                None => eprintln!("[UGK-DRYRUN] {cmd}"),
            }
        }
        self.log.lock().push(ExecutedCommand {
            command: cmd.clone(),
            input: input.map(str::to_string),
        });

        let argv = cmd.argv();
        if self.failing.lock().iter().any(|p| *p == argv[0]) {
            return Err(UgkError::Execution {
                command: cmd.to_string(),
                details: "injected failure".to_string(),
            });
        }
        if self.apply_filesystem {
            apply_locally(cmd, input)?;
        }
        Ok(())
    }
}

impl PrivilegedExecutor for RecordingExecutor {
    fn execute(&self, cmd: &PrivilegedCommand) -> Result<()> {
        self.record(cmd, None)
    }

    fn execute_with_input(&self, cmd: &PrivilegedCommand, input: &str) -> Result<()> {
        self.record(cmd, Some(input))
    }
}

fn apply_locally(cmd: &PrivilegedCommand, input: Option<&str>) -> Result<()> {
    match cmd {
        PrivilegedCommand::Mkdir { path } => {
            fs::create_dir_all(path).map_err(|source| UgkError::io(path, source))
        }
        PrivilegedCommand::RemoveDir { path } => {
            fs::remove_dir(path).map_err(|source| UgkError::io(path, source))
        }
        PrivilegedCommand::TeeAppend { path } => {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| UgkError::io(path, source))?;
            file.write_all(input.unwrap_or_default().as_bytes())
                .map_err(|source| UgkError::io(path, source))
        }
        PrivilegedCommand::TeeWrite { path } => {
            fs::write(path, input.unwrap_or_default()).map_err(|source| UgkError::io(path, source))
        }
        PrivilegedCommand::Mount { .. }
        | PrivilegedCommand::Umount { .. }
        | PrivilegedCommand::RuleReload
        | PrivilegedCommand::RuleTrigger => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_vocabulary() {
        let p = PathBuf::from("/media/alice/ABC");
        assert_eq!(
            PrivilegedCommand::Mkdir { path: p.clone() }.to_string(),
            "mkdir -p /media/alice/ABC"
        );
        assert_eq!(
            PrivilegedCommand::Mount {
                device: "/dev/sdb1".into(),
                target: p.clone()
            }
            .to_string(),
            "mount /dev/sdb1 /media/alice/ABC"
        );
        assert_eq!(
            PrivilegedCommand::TeeAppend {
                path: "/etc/udev/rules.d/x.rules".into()
            }
            .argv(),
            vec!["tee", "-a", "/etc/udev/rules.d/x.rules"]
        );
        assert_eq!(
            PrivilegedCommand::RuleReload.to_string(),
            "udevadm control --reload"
        );
        assert_eq!(PrivilegedCommand::RuleTrigger.to_string(), "udevadm trigger");
        assert!(PrivilegedCommand::TeeWrite { path: p }.takes_input());
        assert!(!PrivilegedCommand::RuleTrigger.takes_input());
    }

    #[test]
    fn path_with_spaces_stays_one_argument() {
        let cmd = PrivilegedCommand::RemoveDir {
            path: "/media/a b/c".into(),
        };
        assert_eq!(cmd.argv(), vec!["rmdir", "/media/a b/c"]);
    }

    #[test]
    fn recording_executor_applies_filesystem_ops() {
        let dir = tempfile::tempdir().unwrap();
        let exec = RecordingExecutor::new().with_filesystem();
        let sub = dir.path().join("a").join("b");
        exec.execute(&PrivilegedCommand::Mkdir { path: sub.clone() })
            .unwrap();
        assert!(sub.is_dir());

        let rules = dir.path().join("r.rules");
        exec.execute_with_input(&PrivilegedCommand::TeeAppend { path: rules.clone() }, "x\n")
            .unwrap();
        exec.execute_with_input(&PrivilegedCommand::TeeAppend { path: rules.clone() }, "y\n")
            .unwrap();
        assert_eq!(fs::read_to_string(&rules).unwrap(), "x\ny\n");
        exec.execute_with_input(&PrivilegedCommand::TeeWrite { path: rules.clone() }, "")
            .unwrap();
        assert_eq!(fs::read_to_string(&rules).unwrap(), "");

        exec.execute(&PrivilegedCommand::RemoveDir { path: sub.clone() })
            .unwrap();
        assert!(!sub.exists());
        assert_eq!(exec.commands().len(), 5);
    }

    #[test]
    fn injected_failure_is_recorded_and_returned() {
        let exec = RecordingExecutor::new();
        exec.fail_program("mount");
        let err = exec
            .execute(&PrivilegedCommand::Mount {
                device: "/dev/sdb1".into(),
                target: "/media/x".into(),
            })
            .unwrap_err();
        assert_eq!(err.code(), "UGK-3001");
        assert_eq!(exec.count_program("mount"), 1);
    }

    #[test]
    fn system_executor_reports_nonzero_exit() {
        // `rmdir` of a missing path fails without needing privilege.
        let dir = tempfile::tempdir().unwrap();
        let exec = SystemExecutor::new(false);
        let err = exec
            .execute(&PrivilegedCommand::RemoveDir {
                path: dir.path().join("missing"),
            })
            .unwrap_err();
        assert!(matches!(err, UgkError::Execution { .. }));
    }

    #[test]
    fn system_executor_feeds_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.rules");
        let exec = SystemExecutor::new(false);
        exec.execute_with_input(&PrivilegedCommand::TeeWrite { path: path.clone() }, "line\n")
            .unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "line\n");
    }
}
