//! Human prompt: ask an operator whether to allow a device.
//!
//! Any failure (no terminal, helper crash, timeout, unparseable answer) is an
//! `Err`; the pipeline turns that into a fail-closed block.

#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use parking_lot::Mutex;

use crate::core::config::{PromptConfig, PromptMode};
use crate::core::errors::{Result, UgkError};
use crate::device::identity::DeviceIdentity;
use crate::history::record::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptReply {
    pub decision: Decision,
    /// Count this allow toward the vendor's auto-allow threshold.
    pub remember: bool,
}

impl PromptReply {
    pub const fn allow(remember: bool) -> Self {
        Self {
            decision: Decision::Allow,
            remember,
        }
    }

    pub const fn block() -> Self {
        Self {
            decision: Decision::Block,
            remember: false,
        }
    }
}

/// Synchronous request/response prompt. Called from worker threads.
pub trait Prompter: Send + Sync {
    fn prompt(&self, identity: &DeviceIdentity) -> Result<PromptReply>;
}

/// Parse an operator answer.
///
/// Accepted: `a`/`allow`, `r`/`remember`/`allow remember`/`allow+remember`,
/// `b`/`block`/`deny`. Case-insensitive; surrounding whitespace ignored.
pub fn parse_reply(raw: &str) -> Result<PromptReply> {
    let answer = raw.trim().to_ascii_lowercase();
    match answer.as_str() {
        "a" | "allow" | "y" | "yes" => Ok(PromptReply::allow(false)),
        "r" | "remember" | "allow remember" | "allow+remember" | "allow,remember" => {
            Ok(PromptReply::allow(true))
        }
        "b" | "block" | "deny" | "n" | "no" => Ok(PromptReply::block()),
        _ => Err(UgkError::Prompt {
            details: format!("unrecognised answer {:?}", raw.trim()),
        }),
    }
}

/// Build the prompter selected by config.
pub fn from_config(cfg: &PromptConfig) -> Box<dyn Prompter> {
    let timeout = Duration::from_secs(cfg.timeout_secs);
    match cfg.mode {
        PromptMode::Tty => Box::new(TerminalPrompter::new(timeout)),
        PromptMode::Command => Box::new(CommandPrompter::new(cfg.command.clone(), timeout)),
        PromptMode::Deny => Box::new(DenyPrompter),
    }
}

// ──────────────────── line input ────────────────────

/// Why no line arrived.
#[derive(Debug)]
enum LineWait {
    TimedOut(Duration),
    Closed(String),
}

impl LineWait {
    fn into_error(self) -> UgkError {
        let details = match self {
            Self::TimedOut(timeout) => format!("no answer within {timeout:?}"),
            Self::Closed(details) => details,
        };
        UgkError::Prompt { details }
    }
}

/// Lines from a blocking reader, read by one long-lived thread.
///
/// The thread outlives any single question, so a line typed after a
/// question timed out stays queued instead of being lost to a stray reader.
struct LineReader {
    lines: Receiver<std::io::Result<String>>,
}

impl LineReader {
    fn spawn<R: Read + Send + 'static>(source: R) -> Result<Self> {
        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name("ugk-prompt".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(source);
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            if tx.send(Ok(line)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
            })
            .map_err(|e| UgkError::Prompt {
                details: format!("failed to spawn prompt reader: {e}"),
            })?;
        Ok(Self { lines: rx })
    }

    /// Drop lines that arrived before the current question.
    fn discard_stale(&self) -> usize {
        self.lines.try_iter().count()
    }

    fn next_line(&self, timeout: Duration) -> std::result::Result<String, LineWait> {
        match self.lines.recv_timeout(timeout) {
            Ok(Ok(line)) => Ok(line),
            Ok(Err(e)) => Err(LineWait::Closed(format!("read failed: {e}"))),
            Err(RecvTimeoutError::Timeout) => Err(LineWait::TimedOut(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(LineWait::Closed("input closed".to_string())),
        }
    }
}

// ──────────────────── terminal ────────────────────

struct TerminalSession {
    out: Box<dyn Write + Send>,
    input: LineReader,
}

impl TerminalSession {
    fn open() -> Result<Self> {
        let tty = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/tty")
            .map_err(|e| UgkError::Prompt {
                details: format!("no controlling terminal: {e}"),
            })?;
        let out = tty.try_clone().map_err(|e| UgkError::Prompt {
            details: format!("terminal clone failed: {e}"),
        })?;
        Ok(Self {
            out: Box::new(out),
            input: LineReader::spawn(tty)?,
        })
    }

    fn ask(
        &mut self,
        identity: &DeviceIdentity,
        timeout: Duration,
    ) -> std::result::Result<String, LineWait> {
        let stale = self.input.discard_stale();
        if stale > 0 {
            eprintln!("[UGK-PROMPT] discarded {stale} late terminal answer(s)");
        }
        write!(
            self.out,
            "\nUSB device connected: vendor={} product={} serial={} ({})\n\
             [a]llow, allow and [r]emember, [b]lock? ",
            identity.vendor_id,
            identity.product_id,
            identity.serial,
            identity.device_node.display()
        )
        .and_then(|()| self.out.flush())
        .map_err(|e| LineWait::Closed(format!("terminal write failed: {e}")))?;
        self.input.next_line(timeout)
    }
}

/// Prompts on the controlling terminal (`/dev/tty`).
///
/// Only one question is on screen at a time; concurrent callers queue. The
/// terminal is opened on first use and reopened after it closes.
pub struct TerminalPrompter {
    timeout: Duration,
    session: Mutex<Option<TerminalSession>>,
}

impl TerminalPrompter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            session: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_session(out: Box<dyn Write + Send>, input: LineReader, timeout: Duration) -> Self {
        Self {
            timeout,
            session: Mutex::new(Some(TerminalSession { out, input })),
        }
    }
}

impl Prompter for TerminalPrompter {
    fn prompt(&self, identity: &DeviceIdentity) -> Result<PromptReply> {
        let mut session = self.session.lock();
        if session.is_none() {
            *session = Some(TerminalSession::open()?);
        }
        let Some(active) = session.as_mut() else {
            return Err(UgkError::Prompt {
                details: "terminal unavailable".to_string(),
            });
        };
        match active.ask(identity, self.timeout) {
            Ok(answer) => parse_reply(&answer),
            Err(wait) => {
                if matches!(wait, LineWait::Closed(_)) {
                    *session = None;
                }
                Err(wait.into_error())
            }
        }
    }
}

// ──────────────────── external helper ────────────────────

/// Runs an external helper (e.g. a desktop dialog) per device.
///
/// The helper gets the identity in `UGK_VENDOR_ID`, `UGK_PRODUCT_ID`,
/// `UGK_SERIAL` and `UGK_DEVICE_NODE`, and answers on the first line of
/// stdout (see [`parse_reply`]). A non-zero exit is a failure.
pub struct CommandPrompter {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandPrompter {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

impl Prompter for CommandPrompter {
    fn prompt(&self, identity: &DeviceIdentity) -> Result<PromptReply> {
        let (program, args) = self.argv.split_first().ok_or_else(|| UgkError::Prompt {
            details: "prompt.command is empty".to_string(),
        })?;

        let mut child = Command::new(program)
            .args(args)
            .env("UGK_VENDOR_ID", &identity.vendor_id)
            .env("UGK_PRODUCT_ID", &identity.product_id)
            .env("UGK_SERIAL", &identity.serial)
            .env("UGK_DEVICE_NODE", &identity.device_node)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| UgkError::Prompt {
                details: format!("{program}: failed to start: {e}"),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| UgkError::Prompt {
            details: format!("{program}: stdout not captured"),
        })?;

        let answer = LineReader::spawn(stdout)
            .and_then(|reader| reader.next_line(self.timeout).map_err(LineWait::into_error));
        if answer.is_err() {
            let _ = child.kill();
        }
        let status = child.wait().map_err(|e| UgkError::Prompt {
            details: format!("{program}: wait failed: {e}"),
        })?;
        let answer = answer?;
        if !status.success() {
            return Err(UgkError::Prompt {
                details: format!("{program}: exited with {status}"),
            });
        }
        parse_reply(&answer)
    }
}

// ──────────────────── headless ────────────────────

/// No operator available: every prompt fails, so unknown devices are blocked.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyPrompter;

impl Prompter for DenyPrompter {
    fn prompt(&self, _identity: &DeviceIdentity) -> Result<PromptReply> {
        Err(UgkError::Prompt {
            details: "no interactive prompt configured".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> DeviceIdentity {
        DeviceIdentity::new("0781", "5567", Some("ABC"), "/dev/bus/usb/001/004")
    }

    fn sh(script: &str, timeout_secs: u64) -> CommandPrompter {
        CommandPrompter::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(timeout_secs),
        )
    }

    #[test]
    fn parses_answers() {
        assert_eq!(parse_reply("a\n").unwrap(), PromptReply::allow(false));
        assert_eq!(parse_reply(" Allow+Remember ").unwrap(), PromptReply::allow(true));
        assert_eq!(parse_reply("r").unwrap(), PromptReply::allow(true));
        assert_eq!(parse_reply("BLOCK").unwrap(), PromptReply::block());
        assert!(parse_reply("").is_err());
        assert!(parse_reply("maybe").is_err());
    }

    #[test]
    fn deny_prompter_always_fails() {
        assert_eq!(DenyPrompter.prompt(&id()).unwrap_err().code(), "UGK-3004");
    }

    #[test]
    fn command_prompter_reads_answer_and_sees_identity() {
        let p = sh(r#"[ "$UGK_VENDOR_ID" = 0781 ] && echo allow+remember"#, 10);
        assert_eq!(p.prompt(&id()).unwrap(), PromptReply::allow(true));
    }

    #[test]
    fn command_prompter_nonzero_exit_fails() {
        let p = sh("echo allow; exit 3", 10);
        assert!(p.prompt(&id()).is_err());
    }

    #[test]
    fn command_prompter_times_out() {
        let p = sh("sleep 30", 1);
        let err = p.prompt(&id()).unwrap_err();
        assert!(err.to_string().contains("no answer"));
    }

    #[test]
    fn empty_command_fails() {
        let p = CommandPrompter::new(Vec::new(), Duration::from_secs(1));
        assert!(p.prompt(&id()).is_err());
    }

    /// Blocking byte source fed from a channel; ends when the sender drops.
    struct ChannelReader {
        rx: Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    fn terminal(timeout: Duration) -> (TerminalPrompter, crossbeam_channel::Sender<Vec<u8>>) {
        let (tx, rx) = unbounded();
        let input = LineReader::spawn(ChannelReader {
            rx,
            pending: Vec::new(),
        })
        .unwrap();
        let prompter = TerminalPrompter::with_session(Box::new(std::io::sink()), input, timeout);
        (prompter, tx)
    }

    #[test]
    fn terminal_timeout_reports_sub_second_wait() {
        let (p, _tx) = terminal(Duration::from_millis(100));
        let err = p.prompt(&id()).unwrap_err();
        assert!(err.to_string().contains("no answer within 100ms"), "{err}");
    }

    #[test]
    fn late_answer_does_not_leak_into_next_question() {
        let (p, tx) = terminal(Duration::from_millis(300));
        assert!(p.prompt(&id()).is_err());

        // Operator answers the expired question after the fact.
        tx.send(b"b\n".to_vec()).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while p.session.lock().as_ref().is_some_and(|s| s.input.lines.is_empty())
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }

        let typist = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            tx.send(b"a\n".to_vec()).unwrap();
            tx
        });
        assert_eq!(p.prompt(&id()).unwrap(), PromptReply::allow(false));
        drop(typist.join().unwrap());
    }

    #[test]
    fn closed_terminal_input_fails_prompt() {
        let (p, tx) = terminal(Duration::from_secs(5));
        drop(tx);
        let err = p.prompt(&id()).unwrap_err();
        assert!(err.to_string().contains("input closed"), "{err}");
        assert!(p.session.lock().is_none());
    }

    #[test]
    fn config_selects_prompter() {
        let cfg = PromptConfig {
            mode: PromptMode::Deny,
            ..PromptConfig::default()
        };
        assert!(from_config(&cfg).prompt(&id()).is_err());
    }
}
