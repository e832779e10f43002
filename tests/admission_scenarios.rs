//! End-to-end admission scenarios: engine + file-backed history + gateway,
//! with privileged commands recorded instead of run.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{FakeSysfs, Harness, ScriptedPrompter, identity_resolver};
use usb_gatekeeper::classifier::Prediction;
use usb_gatekeeper::device::identity::HotplugEvent;
use usb_gatekeeper::device::resolver::SysfsResolver;
use usb_gatekeeper::enforce::executor::PrivilegedCommand;
use usb_gatekeeper::enforce::gateway::{UnmountOutcome, block_rule};
use usb_gatekeeper::engine::admission::{Enforced, Handled};
use usb_gatekeeper::engine::prompt::PromptReply;
use usb_gatekeeper::history::record::{Decision, DecisionSource};
use usb_gatekeeper::history::store::{FileHistoryStore, HistoryStore};
use usb_gatekeeper::logger::dual::ActivityEvent;

const SDA1: &str = "/dev/sda1";

fn attach(serial: &str, node: &str) -> HotplugEvent {
    HotplugEvent::attach(Some("1234"), Some("5678"), Some(serial), node)
}

fn expect_attached(handled: Handled) -> usb_gatekeeper::engine::admission::AttachOutcome {
    match handled {
        Handled::Attached(outcome) => outcome,
        other => panic!("expected attach outcome, got {other:?}"),
    }
}

// ════════════════════════════════════════════════════════════════
// BLOCK
// ════════════════════════════════════════════════════════════════

#[test]
fn human_block_writes_record_and_one_rule() {
    let h = Harness::new(
        ScriptedPrompter::new([Some(PromptReply::block())]),
        identity_resolver(&[SDA1]),
    );

    let outcome = expect_attached(h.engine.handle_event(attach("ABC", SDA1), Instant::now()));

    assert!(outcome.persisted);
    assert!(matches!(outcome.enforcement, Ok(Enforced::Blocked(_))));

    let decisions = h.history.decisions();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].decision, Decision::Block);
    assert_eq!(decisions[0].serial, "ABC");
    assert_eq!(decisions[0].device_node, PathBuf::from(SDA1));

    assert_eq!(h.block_rules(), format!("{}\n", block_rule("1234", "5678")));
    assert_eq!(h.history.vendor_allow_count("1234"), 0);
    assert!(h.engine.is_seen(Path::new(SDA1)));
    assert_eq!(h.predictor.calls(), 1);
    assert_eq!(h.prompter.calls(), 1);
}

#[test]
fn second_attach_before_detach_is_skipped() {
    let h = Harness::new(
        ScriptedPrompter::new([Some(PromptReply::block())]),
        identity_resolver(&[SDA1]),
    );
    let now = Instant::now();
    h.engine.handle_event(attach("ABC", SDA1), now);
    let tee_before = h.exec.count_program("tee");

    assert!(matches!(
        h.engine.handle_event(attach("ABC", SDA1), now),
        Handled::Duplicate
    ));

    assert_eq!(h.history.decisions().len(), 1);
    assert_eq!(h.exec.count_program("tee"), tee_before);
    assert_eq!(h.block_rules().lines().count(), 1);
    assert_eq!(h.prompter.calls(), 1);
    assert!(
        h.drain_activity()
            .iter()
            .any(|e| matches!(e, ActivityEvent::AttachSkipped { .. }))
    );
}

#[test]
fn repeated_block_of_same_pair_keeps_one_rule_line() {
    let h = Harness::new(
        ScriptedPrompter::new([Some(PromptReply::block()), Some(PromptReply::block())]),
        identity_resolver(&[SDA1, "/dev/sdb1"]),
    );
    let now = Instant::now();
    h.engine.handle_event(attach("ABC", SDA1), now);
    let second = expect_attached(h.engine.handle_event(attach("DEF", "/dev/sdb1"), now));

    let Ok(Enforced::Blocked(block)) = second.enforcement else {
        panic!("expected block");
    };
    assert!(!block.rule_appended);
    assert_eq!(h.block_rules().lines().count(), 1);
    assert_eq!(h.history.decisions().len(), 2);
}

#[test]
fn prompt_failure_blocks() {
    let h = Harness::new(ScriptedPrompter::new([None]), identity_resolver(&[SDA1]));
    let outcome = expect_attached(h.engine.handle_event(attach("ABC", SDA1), Instant::now()));
    assert_eq!(outcome.record.decision, Decision::Block);
    assert_eq!(outcome.record.source, DecisionSource::FailClosed);
    assert_eq!(h.block_rules().lines().count(), 1);
}

// ════════════════════════════════════════════════════════════════
// ALLOW + HISTORY
// ════════════════════════════════════════════════════════════════

#[test]
fn sixth_device_from_remembered_vendor_is_auto_allowed() {
    let h = Harness::new(
        ScriptedPrompter::repeating(PromptReply::allow(true), 5),
        identity_resolver(&[
            "/dev/sdb1", "/dev/sdc1", "/dev/sdd1", "/dev/sde1", "/dev/sdf1", "/dev/sdg1",
        ]),
    );
    let now = Instant::now();
    for (serial, node) in [
        ("S1", "/dev/sdb1"),
        ("S2", "/dev/sdc1"),
        ("S3", "/dev/sdd1"),
        ("S4", "/dev/sde1"),
        ("S5", "/dev/sdf1"),
    ] {
        let outcome = expect_attached(h.engine.handle_event(attach(serial, node), now));
        assert_eq!(outcome.record.source, DecisionSource::Prompt);
        assert!(outcome.record.remember);
    }
    assert_eq!(h.history.vendor_allow_count("1234"), 5);
    assert_eq!(h.prompter.calls(), 5);
    assert_eq!(h.predictor.calls(), 5);

    let sixth = expect_attached(h.engine.handle_event(attach("S6", "/dev/sdg1"), now));
    assert_eq!(sixth.record.decision, Decision::Allow);
    assert_eq!(sixth.record.source, DecisionSource::History);
    assert_eq!(h.prompter.calls(), 5);
    assert_eq!(h.predictor.calls(), 5);
    assert_eq!(
        sixth.enforcement.unwrap(),
        Enforced::Mounted(h.mount_point("S6"))
    );
}

#[test]
fn classifier_allow_skips_prompt() {
    let h = Harness::with_predictor(
        ScriptedPrompter::new([]),
        Prediction::Allow,
        identity_resolver(&[SDA1]),
    );
    let outcome = expect_attached(h.engine.handle_event(attach("ABC", SDA1), Instant::now()));
    assert_eq!(outcome.record.source, DecisionSource::Classifier);
    assert_eq!(h.prompter.calls(), 0);
    assert_eq!(h.history.vendor_allow_count("1234"), 0);
}

#[test]
fn history_survives_reopen() {
    let h = Harness::new(
        ScriptedPrompter::new([Some(PromptReply::allow(true)), Some(PromptReply::block())]),
        identity_resolver(&[SDA1, "/dev/sdb1"]),
    );
    let now = Instant::now();
    h.engine.handle_event(attach("ABC", SDA1), now);
    h.engine.handle_event(attach("DEF", "/dev/sdb1"), now);

    let reopened = FileHistoryStore::new(
        h.config.paths.decision_log.clone(),
        h.config.paths.vendor_counts.clone(),
    );
    assert_eq!(reopened.decisions(), h.history.decisions());
    assert_eq!(reopened.vendor_allow_count("1234"), 1);
    let mount = reopened.find_mount_record(Path::new(SDA1), None).unwrap();
    assert_eq!(mount.serial, "ABC");
    assert_eq!(mount.decision, Decision::Allow);
}

// ════════════════════════════════════════════════════════════════
// DETACH
// ════════════════════════════════════════════════════════════════

#[test]
fn detach_after_allow_unmounts_and_removes_dir() {
    let h = Harness::new(
        ScriptedPrompter::new([Some(PromptReply::allow(false))]),
        identity_resolver(&[SDA1]),
    );
    let now = Instant::now();
    h.engine.handle_event(attach("ABC", SDA1), now);
    let target = h.mount_point("ABC");
    assert!(target.is_dir());

    let handled = h.engine.handle_event(HotplugEvent::detach(SDA1), now);
    let Handled::Detached(Ok(UnmountOutcome::Unmounted {
        mount_point,
        removed_dir,
    })) = handled
    else {
        panic!("expected unmount, got {handled:?}");
    };
    assert_eq!(mount_point, target);
    assert!(removed_dir);
    assert!(!target.exists());

    let lines = h.exec.lines();
    assert!(lines.contains(&format!("umount {}", target.display())));
    assert!(lines.contains(&format!("rmdir {}", target.display())));
    assert!(!h.engine.is_seen(Path::new(SDA1)));
}

#[test]
fn detach_without_record_fails_without_rmdir() {
    let h = Harness::new(ScriptedPrompter::new([]), identity_resolver(&[SDA1]));
    let err = h
        .engine
        .process_detach(Path::new("/dev/sdz1"))
        .unwrap_err();
    assert_eq!(err.code(), "UGK-2003");
    assert_eq!(h.exec.count_program("umount"), 0);
    assert_eq!(h.exec.count_program("rmdir"), 0);
}

#[test]
fn detach_after_block_touches_nothing() {
    let h = Harness::new(
        ScriptedPrompter::new([Some(PromptReply::block())]),
        identity_resolver(&[SDA1]),
    );
    let now = Instant::now();
    h.engine.handle_event(attach("ABC", SDA1), now);
    assert!(matches!(
        h.engine.handle_event(HotplugEvent::detach(SDA1), now),
        Handled::Detached(Ok(UnmountOutcome::NotMounted))
    ));
    assert_eq!(h.exec.count_program("umount"), 0);
}

#[test]
fn mount_point_gone_before_detach_skips_rmdir() {
    let h = Harness::new(
        ScriptedPrompter::new([Some(PromptReply::allow(false))]),
        identity_resolver(&[SDA1]),
    );
    let now = Instant::now();
    h.engine.handle_event(attach("ABC", SDA1), now);
    std::fs::remove_dir(h.mount_point("ABC")).unwrap();

    let handled = h.engine.handle_event(HotplugEvent::detach(SDA1), now);
    assert!(matches!(
        handled,
        Handled::Detached(Ok(UnmountOutcome::Unmounted {
            removed_dir: false,
            ..
        }))
    ));
    assert_eq!(h.exec.count_program("rmdir"), 0);
}

// ════════════════════════════════════════════════════════════════
// INCOMPLETE EVENTS
// ════════════════════════════════════════════════════════════════

#[test]
fn incomplete_attach_waits_for_missing_ids() {
    let h = Harness::new(
        ScriptedPrompter::new([Some(PromptReply::allow(false))]),
        identity_resolver(&[SDA1]),
    );
    let now = Instant::now();

    let first = h.engine.handle_event(
        HotplugEvent::attach(None, Some("5678"), Some("ABC"), SDA1),
        now,
    );
    assert!(matches!(first, Handled::Deferred { .. }));
    assert!(h.history.decisions().is_empty());
    assert!(!h.engine.is_seen(Path::new(SDA1)));

    let second = h.engine.handle_event(
        HotplugEvent::attach(Some("1234"), None, None, SDA1),
        now + Duration::from_millis(10),
    );
    let outcome = expect_attached(second);
    assert_eq!(outcome.record.serial, "ABC");
    assert_eq!(h.history.decisions().len(), 1);
}

#[test]
fn incomplete_attach_expires_after_debounce() {
    let h = Harness::new(ScriptedPrompter::new([]), identity_resolver(&[SDA1]));
    let now = Instant::now();
    h.engine
        .handle_event(HotplugEvent::attach(Some("1234"), None, None, SDA1), now);
    let handled = h.engine.run_due(now + Duration::from_millis(50));
    assert!(matches!(handled.as_slice(), [Handled::Expired]));
    assert!(h.history.decisions().is_empty());
    assert!(h.exec.commands().is_empty());
}

// ════════════════════════════════════════════════════════════════
// SYSFS RESOLUTION
// ════════════════════════════════════════════════════════════════

#[cfg(unix)]
#[test]
fn usb_node_mounts_partition_found_in_sysfs() {
    let sys = tempfile::tempdir().unwrap();
    FakeSysfs::new(sys.path()).usb_storage(1, 4, "sdb");
    let h = Harness::new(
        ScriptedPrompter::new([Some(PromptReply::allow(false))]),
        Arc::new(SysfsResolver::new(sys.path(), "/dev")),
    );

    let outcome = expect_attached(
        h.engine
            .handle_event(attach("ABC", "/dev/bus/usb/001/004"), Instant::now()),
    );
    assert!(outcome.enforcement.is_ok());
    assert!(h.exec.commands().iter().any(|c| c.command
        == PrivilegedCommand::Mount {
            device: PathBuf::from("/dev/sdb1"),
            target: h.mount_point("ABC"),
        }));
}

#[cfg(unix)]
#[test]
fn unresolvable_node_keeps_record_but_fails_enforcement() {
    let sys = tempfile::tempdir().unwrap();
    FakeSysfs::new(sys.path()).usb_storage(1, 4, "sdb");
    let h = Harness::new(
        ScriptedPrompter::new([Some(PromptReply::allow(false))]),
        Arc::new(SysfsResolver::new(sys.path(), "/dev")),
    );

    let outcome = expect_attached(
        h.engine
            .handle_event(attach("ABC", "/dev/bus/usb/001/009"), Instant::now()),
    );
    assert_eq!(outcome.enforcement.unwrap_err().code(), "UGK-2001");
    assert_eq!(h.history.decisions().len(), 1);
    assert_eq!(h.exec.count_program("mount"), 0);
}
