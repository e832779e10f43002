//! Decision History Store: decision log + vendor allow counters.
//!
//! Both files are JSON and are always replaced whole (write `.tmp`, fsync,
//! `rename()`), so a crash mid-write leaves the previous version intact.
//! Readers treat a missing or unparseable file as empty; admission must keep
//! working when history is damaged. A corrupt file is moved aside before the
//! next write so its contents survive for inspection.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::errors::{Result, UgkError};
use crate::history::record::{DecisionRecord, MountRecord};

/// Persistence contract used by the admission engine. No policy lives here.
pub trait HistoryStore: Send + Sync {
    /// Append one record. The record is durable once this returns `Ok`.
    fn append_decision(&self, record: &DecisionRecord) -> Result<()>;

    /// All records, oldest first. Unreadable storage reads as empty.
    fn decisions(&self) -> Vec<DecisionRecord>;

    /// Most recent record for `device_node`, as a mount record. With a
    /// `session`, records from other engine runs are not considered.
    fn find_mount_record(&self, device_node: &Path, session: Option<&str>) -> Option<MountRecord> {
        self.decisions()
            .iter()
            .rev()
            .filter(|r| session.is_none_or(|s| r.session.as_deref() == Some(s)))
            .find(|r| r.device_node == device_node)
            .map(MountRecord::from)
    }

    /// Remembered allows for `vendor_id`; unreadable storage reads as zero.
    fn vendor_allow_count(&self, vendor_id: &str) -> u64 {
        self.vendor_allow_counts()
            .get(vendor_id)
            .copied()
            .unwrap_or(0)
    }

    fn vendor_allow_counts(&self) -> BTreeMap<String, u64>;

    /// Atomically increment and return the new count.
    fn increment_vendor_allow_count(&self, vendor_id: &str) -> Result<u64>;

    /// Maintenance: clear the decision log and all counters.
    fn reset(&self) -> Result<()>;
}

// ──────────────────── file-backed store ────────────────────

/// JSON-file history store.
pub struct FileHistoryStore {
    decision_log: PathBuf,
    vendor_counts: PathBuf,
    // Serializes read-modify-write of both files.
    write_lock: Mutex<()>,
}

impl FileHistoryStore {
    pub fn new(decision_log: impl Into<PathBuf>, vendor_counts: impl Into<PathBuf>) -> Self {
        Self {
            decision_log: decision_log.into(),
            vendor_counts: vendor_counts.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn decision_log_path(&self) -> &Path {
        &self.decision_log
    }

    pub fn vendor_counts_path(&self) -> &Path {
        &self.vendor_counts
    }
}

impl HistoryStore for FileHistoryStore {
    fn append_decision(&self, record: &DecisionRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut records: Vec<DecisionRecord> = load_or_quarantine(&self.decision_log)?;
        records.push(record.clone());
        write_json_atomic(&self.decision_log, &records)
    }

    fn decisions(&self) -> Vec<DecisionRecord> {
        read_tolerant(&self.decision_log)
    }

    fn vendor_allow_counts(&self) -> BTreeMap<String, u64> {
        read_tolerant(&self.vendor_counts)
    }

    fn increment_vendor_allow_count(&self, vendor_id: &str) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let mut counts: BTreeMap<String, u64> = load_or_quarantine(&self.vendor_counts)?;
        let slot = counts.entry(vendor_id.to_string()).or_insert(0);
        *slot = slot.saturating_add(1);
        let updated = *slot;
        write_json_atomic(&self.vendor_counts, &counts)?;
        Ok(updated)
    }

    fn reset(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        write_json_atomic(&self.decision_log, &Vec::<DecisionRecord>::new())?;
        write_json_atomic(&self.vendor_counts, &BTreeMap::<String, u64>::new())
    }
}

// ──────────────────── in-memory store ────────────────────

/// Volatile store for tests and dry runs.
#[derive(Default)]
pub struct MemoryHistoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    records: Vec<DecisionRecord>,
    counts: BTreeMap<String, u64>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a vendor counter.
    pub fn set_vendor_allow_count(&self, vendor_id: &str, count: u64) {
        self.inner.lock().counts.insert(vendor_id.to_string(), count);
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn append_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.inner.lock().records.push(record.clone());
        Ok(())
    }

    fn decisions(&self) -> Vec<DecisionRecord> {
        self.inner.lock().records.clone()
    }

    fn vendor_allow_counts(&self) -> BTreeMap<String, u64> {
        self.inner.lock().counts.clone()
    }

    fn increment_vendor_allow_count(&self, vendor_id: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        let slot = inner.counts.entry(vendor_id.to_string()).or_insert(0);
        *slot = slot.saturating_add(1);
        Ok(*slot)
    }

    fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.counts.clear();
        Ok(())
    }
}

// ──────────────────── file helpers ────────────────────

/// Read a JSON file; missing or corrupt reads as `T::default()`.
fn read_tolerant<T: DeserializeOwned + Default>(path: &Path) -> T {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            eprintln!(
                "[UGK-HISTORY] cannot read {}: {e}; treating as empty",
                path.display()
            );
            return T::default();
        }
    };
    if raw.trim().is_empty() {
        return T::default();
    }
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        eprintln!(
            "[UGK-HISTORY] {} is corrupt ({e}); treating as empty",
            path.display()
        );
        T::default()
    })
}

/// Load for a read-modify-write. A corrupt file is renamed to
/// `<name>.corrupt-<unix-ms>` so the rewrite does not destroy it.
fn load_or_quarantine<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => return Err(UgkError::io(path, source)),
    };
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(value),
        Err(e) => {
            let mut aside = path.as_os_str().to_owned();
            aside.push(format!(".corrupt-{}", chrono::Utc::now().timestamp_millis()));
            let aside = PathBuf::from(aside);
            fs::rename(path, &aside).map_err(|source| UgkError::io(path, source))?;
            eprintln!(
                "[UGK-HISTORY] {} is corrupt ({e}); moved to {} and starting fresh",
                path.display(),
                aside.display()
            );
            Ok(T::default())
        }
    }
}

/// Write JSON atomically: write to `.tmp`, fsync, then rename.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| UgkError::io(parent, source))?;
    }

    let json = serde_json::to_string_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);

    let result = (|| -> std::io::Result<()> {
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)
    })();

    if let Err(source) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(UgkError::io(path, source));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::identity::DeviceIdentity;
    use crate::history::record::{Decision, DecisionSource};

    fn store(dir: &Path) -> FileHistoryStore {
        FileHistoryStore::new(
            dir.join("decisions.json"),
            dir.join("vendor_allow_counts.json"),
        )
    }

    fn record(node: &str, serial: &str, decision: Decision) -> DecisionRecord {
        let id = DeviceIdentity::new("1234", "5678", Some(serial), node);
        DecisionRecord::new(&id, decision, DecisionSource::Prompt, false)
    }

    #[test]
    fn round_trip_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let rec = record("/dev/bus/usb/001/004", "ABC", Decision::Block);
        s.append_decision(&rec).unwrap();

        let reopened = store(dir.path());
        let loaded = reopened.decisions();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], rec);
    }

    #[test]
    fn missing_files_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(s.decisions().is_empty());
        assert_eq!(s.vendor_allow_count("1234"), 0);
        assert!(s.find_mount_record(Path::new("/dev/sda1"), None).is_none());
    }

    #[test]
    fn truncated_log_reads_as_empty_and_is_quarantined_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        fs::write(
            s.decision_log_path(),
            r#"[{"vendor_id":"1234","product_id":"56"#,
        )
        .unwrap();

        assert!(s.decisions().is_empty());

        s.append_decision(&record("/dev/sda1", "ABC", Decision::Allow))
            .unwrap();
        assert_eq!(s.decisions().len(), 1);

        let quarantined = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .count();
        assert_eq!(quarantined, 1);
    }

    #[test]
    fn corrupt_counts_read_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        fs::write(s.vendor_counts_path(), "{not json").unwrap();
        assert_eq!(s.vendor_allow_count("1234"), 0);
        assert_eq!(s.increment_vendor_allow_count("1234").unwrap(), 1);
    }

    #[test]
    fn counters_increment_per_vendor() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert_eq!(s.increment_vendor_allow_count("1234").unwrap(), 1);
        assert_eq!(s.increment_vendor_allow_count("1234").unwrap(), 2);
        assert_eq!(s.increment_vendor_allow_count("abcd").unwrap(), 1);
        assert_eq!(s.vendor_allow_count("1234"), 2);
        assert_eq!(s.vendor_allow_counts().len(), 2);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let s = std::sync::Arc::new(store(dir.path()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = std::sync::Arc::clone(&s);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        s.increment_vendor_allow_count("1234").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.vendor_allow_count("1234"), 40);
    }

    #[test]
    fn mount_record_uses_most_recent_entry_for_node() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.append_decision(&record("/dev/sda1", "OLD", Decision::Block))
            .unwrap();
        s.append_decision(&record("/dev/sdb1", "OTHER", Decision::Allow))
            .unwrap();
        s.append_decision(&record("/dev/sda1", "NEW", Decision::Allow))
            .unwrap();

        let mount = s.find_mount_record(Path::new("/dev/sda1"), None).unwrap();
        assert_eq!(mount.serial, "NEW");
        assert_eq!(mount.decision, Decision::Allow);
    }

    #[test]
    fn reset_clears_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.append_decision(&record("/dev/sda1", "ABC", Decision::Allow))
            .unwrap();
        s.increment_vendor_allow_count("1234").unwrap();
        s.reset().unwrap();
        assert!(s.decisions().is_empty());
        assert_eq!(s.vendor_allow_count("1234"), 0);
        assert!(!dir.path().join("decisions.json.tmp").exists());
    }

    #[test]
    fn memory_store_matches_contract() {
        let s = MemoryHistoryStore::new();
        s.set_vendor_allow_count("1234", 4);
        assert_eq!(s.increment_vendor_allow_count("1234").unwrap(), 5);
        s.append_decision(&record("/dev/sda1", "ABC", Decision::Allow))
            .unwrap();
        assert!(s.find_mount_record(Path::new("/dev/sda1"), None).is_some());
        s.reset().unwrap();
        assert!(s.decisions().is_empty());
    }
}
