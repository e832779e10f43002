//! Hotplug event source: `udevadm monitor` property stream → [`HotplugEvent`]s.
//!
//! The monitor is run as a child process; its stdout is a sequence of
//! blank-line separated property blocks. A reader thread parses each block
//! and forwards USB device add/remove events over a bounded channel.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;

use crossbeam_channel::Sender;

use crate::core::errors::{Result, UgkError};
use crate::device::identity::HotplugEvent;

const UDEVADM: &str = "udevadm";
const MONITOR_ARGS: [&str; 4] = [
    "monitor",
    "--udev",
    "--property",
    "--subsystem-match=usb",
];

/// Convert one udev property block into an event.
///
/// Only whole USB devices with a device node are of interest; interfaces and
/// other actions (`bind`, `change`, ...) yield `None`.
pub fn event_from_properties(props: &HashMap<String, String>) -> Option<HotplugEvent> {
    let node = props.get("DEVNAME").filter(|n| !n.is_empty())?;
    if props
        .get("DEVTYPE")
        .is_some_and(|devtype| devtype != "usb_device")
    {
        return None;
    }

    match props.get("ACTION").map(String::as_str) {
        Some("add") => Some(HotplugEvent::attach(
            props.get("ID_VENDOR_ID").map(String::as_str),
            props.get("ID_MODEL_ID").map(String::as_str),
            props.get("ID_SERIAL_SHORT").map(String::as_str),
            PathBuf::from(node),
        )),
        Some("remove") => Some(HotplugEvent::detach(PathBuf::from(node))),
        _ => None,
    }
}

/// Parse a property stream, forwarding every recognised event.
///
/// Returns the number of events forwarded. Stops early when the receiving
/// side of the channel is gone.
pub fn forward_events<R: BufRead>(mut reader: R, tx: &Sender<HotplugEvent>) -> usize {
    let mut forwarded = 0;
    let mut block: HashMap<String, String> = HashMap::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("[UGK-HOTPLUG] read error on monitor stream: {e}");
                break;
            }
        }
        // Property values come from device descriptors; one bad line must
        // not end the stream.
        let Ok(line) = std::str::from_utf8(&buf) else {
            eprintln!("[UGK-HOTPLUG] skipping non-UTF-8 property line");
            continue;
        };
        let line = line.trim_end();
        if line.is_empty() {
            match flush_block(&mut block, tx) {
                Flush::Sent => forwarded += 1,
                Flush::Skipped => {}
                Flush::Disconnected => return forwarded,
            }
            continue;
        }
        // Header lines ("UDEV  [123.4] add /devices/... (usb)") carry no '='.
        if let Some((key, value)) = line.split_once('=') {
            block.insert(key.to_string(), value.to_string());
        }
    }
    if matches!(flush_block(&mut block, tx), Flush::Sent) {
        forwarded += 1;
    }
    forwarded
}

enum Flush {
    Sent,
    Skipped,
    Disconnected,
}

fn flush_block(block: &mut HashMap<String, String>, tx: &Sender<HotplugEvent>) -> Flush {
    if block.is_empty() {
        return Flush::Skipped;
    }
    let event = event_from_properties(block);
    block.clear();
    let Some(event) = event else {
        return Flush::Skipped;
    };
    if tx.send(event).is_err() {
        Flush::Disconnected
    } else {
        Flush::Sent
    }
}

/// Producer of raw hotplug events.
///
/// Delivery ends when the source drops its sender; the consumer sees the
/// channel disconnect and may `start` the source again.
pub trait HotplugSource: Send {
    fn name(&self) -> &'static str;
    fn start(&mut self, tx: Sender<HotplugEvent>) -> Result<()>;
    fn stop(&mut self);
}

/// Running `udevadm monitor` child plus its reader thread.
struct UdevadmMonitor {
    child: Child,
    reader: Option<thread::JoinHandle<usize>>,
}

impl UdevadmMonitor {
    fn spawn(tx: Sender<HotplugEvent>) -> Result<Self> {
        let mut child = Command::new(UDEVADM)
            .args(MONITOR_ARGS)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| UgkError::io(UDEVADM, source))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(UgkError::Runtime {
                details: "udevadm monitor stdout not captured".to_string(),
            });
        };

        let reader = thread::Builder::new()
            .name("ugk-hotplug".to_string())
            .spawn(move || forward_events(BufReader::new(stdout), &tx))
            .map_err(|e| UgkError::Runtime {
                details: format!("failed to spawn hotplug reader thread: {e}"),
            })?;

        Ok(Self {
            child,
            reader: Some(reader),
        })
    }

    /// Kill the child and join the reader. Returns events forwarded.
    fn stop(mut self) -> usize {
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reader
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or(0)
    }
}

/// Linux udev event source backed by `udevadm monitor`.
#[derive(Default)]
pub struct UdevadmMonitorSource {
    running: Option<UdevadmMonitor>,
}

impl UdevadmMonitorSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HotplugSource for UdevadmMonitorSource {
    fn name(&self) -> &'static str {
        "udevadm-monitor"
    }

    fn start(&mut self, tx: Sender<HotplugEvent>) -> Result<()> {
        self.stop();
        self.running = Some(UdevadmMonitor::spawn(tx)?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(monitor) = self.running.take() {
            let forwarded = monitor.stop();
            eprintln!("[UGK-HOTPLUG] udevadm monitor stopped ({forwarded} events forwarded)");
        }
    }
}

impl Drop for UdevadmMonitorSource {
    fn drop(&mut self) {
        self.stop();
    }
}
