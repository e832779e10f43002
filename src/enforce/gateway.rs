//! Enforcement gateway: turns admission decisions into OS state.
//!
//! Allow mounts the device's partition under `<media-root>/<user>/<serial>`.
//! Block appends a deauthorization rule for the vendor/product pair to the
//! block-rule file and reloads udev. Automount is toggled through a separate
//! override rule file. Every privileged step goes through the executor and
//! every failure is returned to the caller.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::config::EnforcementConfig;
use crate::core::errors::{Result, UgkError};
use crate::core::paths::mount_point;
use crate::device::identity::DeviceIdentity;
use crate::device::resolver::BlockDeviceResolver;
use crate::enforce::executor::{PrivilegedCommand, PrivilegedExecutor};
use crate::history::record::Decision;
use crate::history::store::HistoryStore;

/// Rule that stops udisks from auto-mounting any block device.
pub const AUTOMOUNT_OVERRIDE_RULE: &str =
    r#"ACTION=="add", SUBSYSTEM=="block", ENV{UDISKS_IGNORE}="1""#;

/// Deauthorization rule for one vendor/product pair. Ids must already be
/// validated.
pub fn block_rule(vendor_id: &str, product_id: &str) -> String {
    format!(r#"ATTR{{idVendor}}=="{vendor_id}", ATTR{{idProduct}}=="{product_id}", ATTR{{authorized}}="0""#)
}

/// Result of a successful block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOutcome {
    pub block_device: PathBuf,
    pub rule: String,
    /// `false` when an identical rule was already present.
    pub rule_appended: bool,
}

/// Result of a successful unmount request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmountOutcome {
    Unmounted {
        mount_point: PathBuf,
        removed_dir: bool,
    },
    /// Latest record for the node is a block; nothing was mounted.
    NotMounted,
}

pub struct EnforcementGateway {
    executor: Arc<dyn PrivilegedExecutor>,
    resolver: Arc<dyn BlockDeviceResolver>,
    media_root: PathBuf,
    mount_user: String,
    automount_rules_file: PathBuf,
    block_rules_file: PathBuf,
    dedupe_block_rules: bool,
}

impl EnforcementGateway {
    pub fn new(
        cfg: &EnforcementConfig,
        executor: Arc<dyn PrivilegedExecutor>,
        resolver: Arc<dyn BlockDeviceResolver>,
    ) -> Self {
        Self {
            executor,
            resolver,
            media_root: cfg.media_root.clone(),
            mount_user: resolve_mount_user(cfg.mount_user.as_deref()),
            automount_rules_file: cfg.automount_rules_file.clone(),
            block_rules_file: cfg.block_rules_file.clone(),
            dedupe_block_rules: cfg.dedupe_block_rules,
        }
    }

    pub fn mount_user(&self) -> &str {
        &self.mount_user
    }

    /// Mount directory for a serial.
    pub fn mount_point_for(&self, serial: &str) -> PathBuf {
        mount_point(&self.media_root, &self.mount_user, serial)
    }

    /// Mount the device's partition. Returns the mount point.
    pub fn allow(&self, identity: &DeviceIdentity) -> Result<PathBuf> {
        let block = self.resolver.resolve(&identity.device_node)?;
        let target = self.mount_point_for(&identity.serial);

        if !target.is_dir() {
            self.executor.execute(&PrivilegedCommand::Mkdir {
                path: target.clone(),
            })?;
        }
        self.executor.execute(&PrivilegedCommand::Mount {
            device: block,
            target: target.clone(),
        })?;
        Ok(target)
    }

    /// Deauthorize the device's vendor/product pair.
    pub fn block(&self, identity: &DeviceIdentity) -> Result<BlockOutcome> {
        if !identity.has_valid_ids() {
            return Err(UgkError::InvalidIdentity {
                details: format!(
                    "refusing rule for vendor {:?} product {:?}",
                    identity.vendor_id, identity.product_id
                ),
            });
        }
        let block_device = self.resolver.resolve(&identity.device_node)?;
        let rule = block_rule(&identity.vendor_id, &identity.product_id);

        let present = self.dedupe_block_rules && self.block_rule_present(&rule);
        if !present {
            self.executor.execute_with_input(
                &PrivilegedCommand::TeeAppend {
                    path: self.block_rules_file.clone(),
                },
                &format!("{rule}\n"),
            )?;
        }
        self.reload_rules()?;

        Ok(BlockOutcome {
            block_device,
            rule,
            rule_appended: !present,
        })
    }

    /// Unmount whatever the latest decision for `device_node` in `session`
    /// mounted.
    pub fn unmount(
        &self,
        device_node: &Path,
        history: &dyn HistoryStore,
        session: Option<&str>,
    ) -> Result<UnmountOutcome> {
        let record =
            history
                .find_mount_record(device_node, session)
                .ok_or_else(|| UgkError::MountRecordMissing {
                    device_node: device_node.to_path_buf(),
                })?;
        if record.decision == Decision::Block {
            return Ok(UnmountOutcome::NotMounted);
        }

        let target = self.mount_point_for(&record.serial);
        self.executor.execute(&PrivilegedCommand::Umount {
            target: target.clone(),
        })?;

        let removed_dir = if target.is_dir() {
            self.executor.execute(&PrivilegedCommand::RemoveDir {
                path: target.clone(),
            })?;
            true
        } else {
            false
        };
        Ok(UnmountOutcome::Unmounted {
            mount_point: target,
            removed_dir,
        })
    }

    /// Enable (truncate override) or disable (write override) automount.
    pub fn set_automount(&self, enabled: bool) -> Result<()> {
        let payload = if enabled {
            String::new()
        } else {
            format!("{AUTOMOUNT_OVERRIDE_RULE}\n")
        };
        self.executor.execute_with_input(
            &PrivilegedCommand::TeeWrite {
                path: self.automount_rules_file.clone(),
            },
            &payload,
        )?;
        self.reload_rules()
    }

    fn reload_rules(&self) -> Result<()> {
        self.executor.execute(&PrivilegedCommand::RuleReload)?;
        self.executor.execute(&PrivilegedCommand::RuleTrigger)
    }

    fn block_rule_present(&self, rule: &str) -> bool {
        fs::read_to_string(&self.block_rules_file)
            .map(|raw| raw.lines().any(|line| line.trim() == rule))
            .unwrap_or(false)
    }
}

/// Configured user, else the invoking sudo user, else the effective user.
pub fn resolve_mount_user(configured: Option<&str>) -> String {
    if let Some(user) = configured.map(str::trim).filter(|u| !u.is_empty()) {
        return user.to_string();
    }
    if let Some(user) = std::env::var("SUDO_USER").ok().filter(|u| !u.is_empty()) {
        return user;
    }
    current_user().unwrap_or_else(|| "root".to_string())
}

#[cfg(unix)]
fn current_user() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::geteuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
}

#[cfg(not(unix))]
fn current_user() -> Option<String> {
    std::env::var("USERNAME").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::resolver::StaticResolver;
    use crate::enforce::executor::RecordingExecutor;
    use crate::history::record::{DecisionRecord, DecisionSource};
    use crate::history::store::MemoryHistoryStore;

    const NODE: &str = "/dev/bus/usb/001/004";

    struct Fixture {
        _dir: tempfile::TempDir,
        media: PathBuf,
        block_rules: PathBuf,
        automount_rules: PathBuf,
        exec: Arc<RecordingExecutor>,
        gateway: EnforcementGateway,
    }

    fn fixture(dedupe: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("media");
        let cfg = EnforcementConfig {
            media_root: media.clone(),
            mount_user: Some("alice".to_string()),
            automount_rules_file: dir.path().join("99-disable-usb-automount.rules"),
            block_rules_file: dir.path().join("99-usb-blacklist.rules"),
            dedupe_block_rules: dedupe,
            ..EnforcementConfig::default()
        };
        let exec = Arc::new(RecordingExecutor::new().with_filesystem());
        let resolver = Arc::new(StaticResolver::new().with(NODE, "/dev/sdb1"));
        let gateway = EnforcementGateway::new(&cfg, exec.clone(), resolver);
        Fixture {
            media,
            block_rules: cfg.block_rules_file,
            automount_rules: cfg.automount_rules_file,
            exec,
            gateway,
            _dir: dir,
        }
    }

    fn id(serial: &str) -> DeviceIdentity {
        DeviceIdentity::new("1234", "5678", Some(serial), NODE)
    }

    #[test]
    fn allow_creates_dir_then_mounts() {
        let f = fixture(true);
        let target = f.gateway.allow(&id("ABC")).unwrap();
        assert_eq!(target, f.media.join("alice").join("ABC"));
        let lines = f.exec.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("mkdir -p "));
        assert_eq!(lines[1], format!("mount /dev/sdb1 {}", target.display()));
    }

    #[test]
    fn allow_skips_mkdir_when_dir_exists() {
        let f = fixture(true);
        fs::create_dir_all(f.media.join("alice").join("ABC")).unwrap();
        f.gateway.allow(&id("ABC")).unwrap();
        assert_eq!(f.exec.count_program("mkdir"), 0);
        assert_eq!(f.exec.count_program("mount"), 1);
    }

    #[test]
    fn allow_unresolvable_runs_nothing() {
        let f = fixture(true);
        let other = DeviceIdentity::new("1234", "5678", Some("ABC"), "/dev/bus/usb/009/009");
        let err = f.gateway.allow(&other).unwrap_err();
        assert_eq!(err.code(), "UGK-2001");
        assert!(f.exec.commands().is_empty());
    }

    #[test]
    fn hostile_serial_stays_under_media_root() {
        let f = fixture(true);
        let target = f.gateway.allow(&id("../../etc")).unwrap();
        assert!(target.starts_with(f.media.join("alice")));
        assert_eq!(target.parent(), Some(f.media.join("alice").as_path()));
    }

    #[test]
    fn block_appends_rule_and_reloads() {
        let f = fixture(true);
        let out = f.gateway.block(&id("ABC")).unwrap();
        assert!(out.rule_appended);
        assert_eq!(
            fs::read_to_string(&f.block_rules).unwrap(),
            "ATTR{idVendor}==\"1234\", ATTR{idProduct}==\"5678\", ATTR{authorized}=\"0\"\n"
        );
        let lines = f.exec.lines();
        assert_eq!(lines[1], "udevadm control --reload");
        assert_eq!(lines[2], "udevadm trigger");
    }

    #[test]
    fn repeated_block_is_deduplicated() {
        let f = fixture(true);
        f.gateway.block(&id("ABC")).unwrap();
        let second = f.gateway.block(&id("ABC")).unwrap();
        assert!(!second.rule_appended);
        assert_eq!(fs::read_to_string(&f.block_rules).unwrap().lines().count(), 1);
        assert_eq!(f.exec.count_program("tee"), 1);
        assert_eq!(f.exec.count_program("udevadm"), 4);
    }

    #[test]
    fn repeated_block_accumulates_without_dedupe() {
        let f = fixture(false);
        f.gateway.block(&id("ABC")).unwrap();
        f.gateway.block(&id("ABC")).unwrap();
        assert_eq!(fs::read_to_string(&f.block_rules).unwrap().lines().count(), 2);
    }

    #[test]
    fn block_rejects_malformed_ids() {
        let f = fixture(true);
        let bad = DeviceIdentity::new("12\"4", "5678", None, NODE);
        assert_eq!(f.gateway.block(&bad).unwrap_err().code(), "UGK-2002");
        assert!(f.exec.commands().is_empty());
    }

    #[test]
    fn unmount_without_record_fails_and_runs_nothing() {
        let f = fixture(true);
        let history = MemoryHistoryStore::new();
        let err = f.gateway.unmount(Path::new(NODE), &history, None).unwrap_err();
        assert_eq!(err.code(), "UGK-2003");
        assert!(f.exec.commands().is_empty());
    }

    #[test]
    fn unmount_after_allow_umounts_and_removes_dir() {
        let f = fixture(true);
        let history = MemoryHistoryStore::new();
        history
            .append_decision(&DecisionRecord::new(
                &id("ABC"),
                Decision::Allow,
                DecisionSource::Prompt,
                false,
            ))
            .unwrap();
        f.gateway.allow(&id("ABC")).unwrap();

        let out = f.gateway.unmount(Path::new(NODE), &history, None).unwrap();
        let target = f.media.join("alice").join("ABC");
        assert_eq!(
            out,
            UnmountOutcome::Unmounted {
                mount_point: target.clone(),
                removed_dir: true
            }
        );
        let lines = f.exec.lines();
        assert_eq!(lines[2], format!("umount {}", target.display()));
        assert_eq!(lines[3], format!("rmdir {}", target.display()));
    }

    #[test]
    fn unmount_after_block_is_noop() {
        let f = fixture(true);
        let history = MemoryHistoryStore::new();
        history
            .append_decision(&DecisionRecord::new(
                &id("ABC"),
                Decision::Block,
                DecisionSource::FailClosed,
                false,
            ))
            .unwrap();
        assert_eq!(
            f.gateway.unmount(Path::new(NODE), &history, None).unwrap(),
            UnmountOutcome::NotMounted
        );
        assert!(f.exec.commands().is_empty());
    }

    #[test]
    fn failed_umount_skips_rmdir() {
        let f = fixture(true);
        let history = MemoryHistoryStore::new();
        history
            .append_decision(&DecisionRecord::new(
                &id("ABC"),
                Decision::Allow,
                DecisionSource::Prompt,
                false,
            ))
            .unwrap();
        fs::create_dir_all(f.media.join("alice").join("ABC")).unwrap();
        f.exec.fail_program("umount");
        assert!(f.gateway.unmount(Path::new(NODE), &history, None).is_err());
        assert_eq!(f.exec.count_program("rmdir"), 0);
    }

    #[test]
    fn automount_toggle_writes_and_truncates_override() {
        let f = fixture(true);
        f.gateway.set_automount(false).unwrap();
        assert_eq!(
            fs::read_to_string(&f.automount_rules).unwrap(),
            format!("{AUTOMOUNT_OVERRIDE_RULE}\n")
        );
        f.gateway.set_automount(true).unwrap();
        assert_eq!(fs::read_to_string(&f.automount_rules).unwrap(), "");
        assert_eq!(f.exec.count_program("udevadm"), 4);
    }

    #[test]
    fn configured_mount_user_wins() {
        assert_eq!(resolve_mount_user(Some("bob")), "bob");
        assert!(!resolve_mount_user(None).is_empty());
    }
}
