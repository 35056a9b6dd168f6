//! End-to-end sync scenarios on in-memory replica pairs.

use duosync_engine::{
    collect_tombstones, now_ms, GlobFilter, SkipReason, SyncConfig, SyncDirection,
};
use duosync_protocol::{ChangeKind, ConflictKind, ConflictPolicy};
use duosync_testkit::prelude::*;
use std::io;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn create_propagates_to_the_other_replica() {
    let pair = ReplicaPair::new();
    pair.left.write("notes.txt", "hello");

    pair.sync();

    let applied = pair.recorder.applied_to(pair.right.id());
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].kind, ChangeKind::Create);
    assert_eq!(applied[0].old_path, None);
    assert_eq!(applied[0].new_path.as_deref(), Some("notes.txt"));

    let source = pair.left.record_at("notes.txt").unwrap();
    let copy = pair.right.record(source.item_id).unwrap();
    assert_eq!(copy.version.get(pair.left.id()), 1);
    assert_eq!(pair.right.read("notes.txt").as_deref(), Some("hello"));
}

#[test]
fn delete_propagates_and_recycles() {
    let pair = ReplicaPair::new();
    pair.left.write("notes.txt", "hello");
    pair.sync();
    let item = pair.left.record_at("notes.txt").unwrap().item_id;

    pair.left.remove("notes.txt");
    pair.sync();

    assert_eq!(pair.right.read("notes.txt"), None);
    assert_eq!(pair.right.recycled("notes.txt"), vec!["hello"]);
    assert!(pair.right.record(item).unwrap().tombstone);
    let applied = pair.recorder.applied_to(pair.right.id());
    assert_eq!(applied.last().unwrap().kind, ChangeKind::Delete);
    assert_eq!(applied.last().unwrap().old_path.as_deref(), Some("notes.txt"));
}

#[test]
fn concurrent_updates_keep_the_newest_and_recycle_the_other() {
    let pair = ReplicaPair::new();
    pair.left.write("notes.txt", "base");
    pair.sync();

    pair.left.write("notes.txt", "left edit");
    pair.right.write("notes.txt", "right edit");
    let report = pair.sync();

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].kind, ConflictKind::UpdateUpdate);
    assert_eq!(pair.left.read("notes.txt").as_deref(), Some("right edit"));
    assert_eq!(pair.right.read("notes.txt").as_deref(), Some("right edit"));
    assert_eq!(pair.left.recycled("notes.txt"), vec!["left edit"]);
    assert!(pair.converged());
}

#[test]
fn update_against_delete_keeps_the_live_copy() {
    let pair = ReplicaPair::new();
    pair.left.write("notes.txt", "base");
    pair.sync();

    pair.left.remove("notes.txt");
    pair.right.write("notes.txt", "still needed");
    let report = pair.sync();

    assert_eq!(report.conflicts[0].kind, ConflictKind::UpdateDelete);
    assert_eq!(pair.left.read("notes.txt").as_deref(), Some("still needed"));
    assert_eq!(pair.sync_until_converged(2), 1);
}

#[test]
fn unchanged_rename_is_detected_as_rename() {
    let pair = ReplicaPair::new();
    pair.left.write("a.txt", "same content");
    pair.sync();

    pair.left.rename("a.txt", "b.txt");
    let (left, right) = pair.orchestrator.detect_changes().unwrap();
    assert_eq!(left.changes.len(), 1);
    assert_eq!(left.changes[0].kind, ChangeKind::Rename);
    assert!(right.is_empty());

    pair.sync();
    let applied = pair.recorder.applied_to(pair.right.id());
    let rename = applied.last().unwrap();
    assert_eq!(rename.kind, ChangeKind::Rename);
    assert_eq!(rename.to_string(), "-- Applied RENAME for file a.txt as b.txt");
    assert_eq!(pair.right.paths(), vec!["b.txt"]);
    assert!(pair.right.recycled("a.txt").is_empty());
}

#[test]
fn failing_item_does_not_stop_the_batch() {
    let pair = ReplicaPair::new();
    for path in ["x.txt", "y.txt", "z.txt"] {
        pair.left.write(path, path);
    }
    pair.right
        .medium
        .fail_on("x.txt", io::ErrorKind::PermissionDenied);

    let report = pair.sync();

    assert_eq!(report.applied_to_remote.len(), 2);
    assert_eq!(report.skipped.len(), 1);
    let skipped = &report.skipped[0];
    assert_eq!(skipped.path, "x.txt");
    assert_eq!(skipped.kind, ChangeKind::Create);
    assert_eq!(skipped.reason, SkipReason::AccessDenied);
    assert!(skipped.cause.is_some());
    assert!(skipped
        .to_string()
        .starts_with("-- Skipped applying CREATE for x.txt due to error"));
    assert_eq!(pair.right.paths(), vec!["y.txt", "z.txt"]);
}

#[test]
fn skipped_item_is_offered_again() {
    let pair = ReplicaPair::new();
    pair.left.write("x.txt", "x");
    pair.right.medium.fail_on("x.txt", io::ErrorKind::Other);
    pair.sync();
    pair.sync();
    assert_eq!(pair.right.read("x.txt"), None);
    assert_eq!(pair.recorder.skipped_on(pair.right.id()).len(), 2);

    pair.right.medium.clear_fault("x.txt");
    let report = pair.sync();
    assert_eq!(report.applied_to_remote.len(), 1);
    assert_eq!(pair.right.read("x.txt").as_deref(), Some("x"));
    assert!(pair.converged());
}

#[test]
fn quiet_session_changes_nothing() {
    let pair = ReplicaPair::new();
    pair.left.write("a.txt", "a");
    pair.right.write("b.txt", "b");
    pair.sync();

    let left = pair.left.replica.store().knowledge().unwrap();
    let right = pair.right.replica.store().knowledge().unwrap();
    let report = pair.sync();

    assert!(report.is_noop());
    assert_eq!(pair.left.replica.store().knowledge().unwrap(), left);
    assert_eq!(pair.right.replica.store().knowledge().unwrap(), right);
}

#[test]
fn deleted_items_never_come_back() {
    let pair = ReplicaPair::new();
    pair.left.write("notes.txt", "hello");
    pair.sync();
    let item = pair.left.record_at("notes.txt").unwrap().item_id;

    pair.left.remove("notes.txt");
    pair.sync();
    let tombstone = pair.left.record(item).unwrap();
    let deleting_tick = tombstone.version.get(pair.left.id());

    for _ in 0..3 {
        pair.sync();
        for side in [&pair.left, &pair.right] {
            let record = side.record(item).unwrap();
            assert!(record.tombstone);
            assert!(record.version.get(pair.left.id()) >= deleting_tick);
            assert_eq!(side.read("notes.txt"), None);
        }
    }
    assert!(pair
        .recorder
        .applied()
        .iter()
        .all(|change| change.kind != ChangeKind::Create || change.replica == pair.right.id()));
}

#[test]
fn divergent_renames_are_skipped_on_both_sides() {
    let pair = ReplicaPair::new();
    pair.left.write("a.txt", "content");
    pair.sync();

    pair.left.rename("a.txt", "left.txt");
    pair.right.rename("a.txt", "right.txt");
    let report = pair.sync();

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].kind, ConflictKind::RenameRename);
    assert!(report.applied_to_local.is_empty() && report.applied_to_remote.is_empty());
    for side in [&pair.left, &pair.right] {
        let skipped = pair.recorder.skipped_on(side.id());
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].reason, SkipReason::UnresolvableConflict);
    }
    assert_eq!(pair.left.paths(), vec!["left.txt"]);
    assert_eq!(pair.right.paths(), vec!["right.txt"]);
}

#[test]
fn create_create_converges_to_one_item() {
    let pair = ReplicaPair::new();
    pair.left.write("same.txt", "left");
    pair.right.write("same.txt", "right");

    let report = pair.sync();
    assert_eq!(report.conflicts[0].kind, ConflictKind::CreateCreate);

    pair.sync_until_converged(3);
    assert_eq!(pair.left.read("same.txt").as_deref(), Some("right"));
    assert_eq!(pair.left.recycled("same.txt"), vec!["left"]);
    assert_eq!(live_state(&pair.left.replica).len(), 1);
}

#[test]
fn rename_onto_a_new_file_converges() {
    let pair = ReplicaPair::new();
    pair.left.write("a.txt", "base");
    pair.sync();

    pair.left.rename("a.txt", "b.txt");
    pair.right.write("b.txt", "fresh remote");
    let report = pair.sync();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].kind, ConflictKind::PathCollision);

    pair.sync_until_converged(3);
    assert!(pair.converged());
    assert_eq!(pair.left.paths(), vec!["b.txt"]);
    assert_eq!(pair.left.read("b.txt").as_deref(), Some("fresh remote"));
    assert_eq!(pair.left.recycled("b.txt"), vec!["base"]);
    assert_eq!(pair.right.recycled("a.txt"), vec!["base"]);
    assert!(pair.sync().is_noop());
}

#[test]
fn winning_rename_replaces_the_new_file() {
    let config = SyncConfig::default().with_policy(ConflictPolicy::LocalWins);
    let pair = ReplicaPair::with_config(config);
    pair.left.write("a.txt", "base");
    pair.sync();

    pair.left.rename("a.txt", "b.txt");
    pair.right.write("b.txt", "fresh remote");
    pair.sync();

    let applied = pair.recorder.applied_to(pair.right.id());
    let moved = applied.last().unwrap();
    assert_eq!(moved.kind, ChangeKind::Rename);
    assert_eq!(moved.old_path.as_deref(), Some("a.txt"));
    assert_eq!(pair.right.paths(), vec!["b.txt"]);
    assert_eq!(pair.right.read("b.txt").as_deref(), Some("base"));
    assert_eq!(pair.right.recycled("b.txt"), vec!["fresh remote"]);

    pair.sync_until_converged(2);
    assert_eq!(live_state(&pair.left.replica).len(), 1);
}

#[test]
fn edit_wins_over_a_rename_onto_its_path() {
    let pair = ReplicaPair::new();
    pair.left.write("a.txt", "moving");
    pair.left.write("b.txt", "kept");
    pair.sync();

    // Left replaces b.txt with a.txt while right edits b.txt.
    pair.left.remove("b.txt");
    pair.left.rename("a.txt", "b.txt");
    pair.right.write("b.txt", "edited remotely");
    let report = pair.sync();
    let kinds: Vec<ConflictKind> = report.conflicts.iter().map(|c| c.kind).collect();
    assert!(kinds.contains(&ConflictKind::UpdateDelete));
    assert!(kinds.contains(&ConflictKind::PathCollision));

    pair.sync_until_converged(3);
    assert_eq!(pair.left.paths(), vec!["b.txt"]);
    assert_eq!(pair.left.read("b.txt").as_deref(), Some("edited remotely"));
    assert_eq!(pair.left.recycled("b.txt"), vec!["moving"]);
    assert_eq!(live_state(&pair.right.replica).len(), 1);
}

#[test]
fn concurrent_rename_and_edit_keep_the_edit() {
    let pair = ReplicaPair::new();
    pair.left.write("a.txt", "base");
    pair.sync();

    pair.left.rename("a.txt", "b.txt");
    pair.right.write("a.txt", "edited remotely");
    let report = pair.sync();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].kind, ConflictKind::UpdateUpdate);

    pair.sync_until_converged(2);
    assert_eq!(pair.left.paths(), vec!["a.txt"]);
    assert_eq!(pair.left.read("a.txt").as_deref(), Some("edited remotely"));
}

#[test]
fn one_way_conflict_is_reported_every_session() {
    let config = SyncConfig::default().with_direction(SyncDirection::UploadOnly);
    let pair = ReplicaPair::with_config(config);
    pair.left.write("notes.txt", "base");
    pair.sync();

    pair.left.write("notes.txt", "left edit");
    pair.right.write("notes.txt", "right edit");
    for _ in 0..2 {
        let report = pair.sync();
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].replica, pair.right.id());
        assert_eq!(report.skipped[0].path, "notes.txt");
        assert_eq!(report.skipped[0].reason, SkipReason::UnresolvableConflict);
    }
    assert_eq!(pair.recorder.skipped_on(pair.right.id()).len(), 2);
    assert_eq!(pair.left.read("notes.txt").as_deref(), Some("left edit"));
    assert_eq!(pair.right.read("notes.txt").as_deref(), Some("right edit"));
}

#[test]
fn local_wins_policy_overrides_recency() {
    let config = SyncConfig::default().with_policy(ConflictPolicy::LocalWins);
    let pair = ReplicaPair::with_config(config);
    pair.left.write("notes.txt", "base");
    pair.sync();

    pair.left.write("notes.txt", "left edit");
    pair.right.write("notes.txt", "right edit");
    pair.sync();

    assert_eq!(pair.right.read("notes.txt").as_deref(), Some("left edit"));
    assert_eq!(pair.right.recycled("notes.txt"), vec!["right edit"]);
    assert!(pair.converged());
}

#[test]
fn upload_only_never_writes_locally() {
    let config = SyncConfig::default().with_direction(SyncDirection::UploadOnly);
    let pair = ReplicaPair::with_config(config);
    pair.left.write("up.txt", "up");
    pair.right.write("down.txt", "down");

    pair.sync();
    pair.sync();

    assert_eq!(pair.left.paths(), vec!["up.txt"]);
    assert_eq!(pair.right.paths(), vec!["down.txt", "up.txt"]);
    assert!(pair.recorder.applied_to(pair.left.id()).is_empty());
}

#[test]
fn excluded_files_are_reported_and_left_alone() {
    let mut pair = ReplicaPair::new();
    pair.left.write("a.txt", "a");
    pair.left.write("link.lnk", "shortcut");
    pair.sync();
    assert_eq!(pair.right.paths(), vec!["a.txt", "link.lnk"]);

    let unfiltered = pair.orchestrator.clone();
    let filter = GlobFilter::excluding_names(["*.lnk"]).unwrap();
    pair.rewire(SyncConfig::default(), Some(Arc::new(filter)));

    pair.left.remove("link.lnk");
    unfiltered.detect_changes().unwrap();
    let report = pair.orchestrator.sync().unwrap();

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].reason, SkipReason::FilteredOut);
    assert_eq!(report.skipped[0].path, "link.lnk");
    assert_eq!(pair.right.read("link.lnk").as_deref(), Some("shortcut"));

    // Edits to excluded files are not even detected.
    pair.right.write("other.lnk", "ignored");
    let report = pair.sync();
    assert!(report.is_noop());
    assert_eq!(pair.left.read("other.lnk"), None);
}

#[test]
fn gc_waits_for_every_peer() {
    let pair = ReplicaPair::new();
    pair.left.write("notes.txt", "hello");
    pair.sync();
    let item = pair.left.record_at("notes.txt").unwrap().item_id;

    // Deleted and detected but not yet synchronized.
    pair.left.remove("notes.txt");
    pair.orchestrator.detect_changes().unwrap();
    let report = collect_tombstones(&pair.left.replica, Duration::ZERO, now_ms() + 1).unwrap();
    assert_eq!(report.purged, 0);
    assert!(pair.left.record(item).is_some());

    pair.sync();
    let later = now_ms() + 1;
    let left = collect_tombstones(&pair.left.replica, Duration::ZERO, later).unwrap();
    let right = collect_tombstones(&pair.right.replica, Duration::ZERO, later).unwrap();
    assert_eq!(left.purged, 1);
    assert_eq!(right.purged, 1);
    assert!(pair.left.record(item).is_none());

    // Purged on both sides, nothing is resurrected.
    let report = pair.sync();
    assert!(report.is_noop());
    assert!(pair.converged());
}
