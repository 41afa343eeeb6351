//! Unit tests for resuming interrupted uploads
//!
//! Tests resume point detection, skip-ahead, commit-only reruns and
//! session mismatch handling.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use tempfile::tempdir;

use common::{options, pattern, write_source, MemoryStore};
use slo_uploader::upload::{NoopObserver, ResumeState};
use slo_uploader::{SloError, UploadSession, MEGABYTE};

const MB: usize = MEGABYTE as usize;

fn new_uploads(store: &MemoryStore, before: usize) -> HashSet<String> {
    store.uploads().into_iter().skip(before).collect()
}

#[tokio::test]
async fn test_resume_uploads_only_missing_segments() {
    let data = pattern(5 * MB);

    // Interrupted run: segments 4 and 5 never make it
    let dir = tempdir().unwrap();
    let source = write_source(dir.path(), "vm.qcow2", &data);
    let store = Arc::new(MemoryStore::new());
    store.fail_path("0004");
    store.fail_path("0005");

    let first = UploadSession::prepare(options(dir.path(), source.clone(), 2)).unwrap();
    let err = first
        .run(store.clone(), Arc::new(NoopObserver))
        .await
        .unwrap_err();
    assert!(matches!(err, SloError::IncompleteUpload { .. }));

    // Second run picks up at segment 4
    store.heal();
    let before = store.uploads().len();
    let second = UploadSession::prepare(options(dir.path(), source, 2)).unwrap();
    assert_eq!(
        second.resume_state(),
        &ResumeState::Resumable {
            resume_point: 4,
            logged: 3
        }
    );
    assert_eq!(second.percent_complete(), 60);

    let report = second
        .run(store.clone(), Arc::new(NoopObserver))
        .await
        .unwrap();
    assert_eq!(report.uploaded, 2);
    assert_eq!(report.reused, 3);
    assert_eq!(
        new_uploads(&store, before),
        HashSet::from([
            "vm.qcow2_segments/0004".to_string(),
            "vm.qcow2_segments/0005".to_string()
        ])
    );

    // Same manifest as an uninterrupted upload
    let clean_dir = tempdir().unwrap();
    let clean_source = write_source(clean_dir.path(), "vm.qcow2", &data);
    let clean_store = Arc::new(MemoryStore::new());
    UploadSession::prepare(options(clean_dir.path(), clean_source, 2))
        .unwrap()
        .run(clean_store.clone(), Arc::new(NoopObserver))
        .await
        .unwrap();

    assert_eq!(
        store.manifest("archive", "vm.qcow2"),
        clean_store.manifest("archive", "vm.qcow2")
    );
}

#[tokio::test]
async fn test_logged_segments_past_a_gap_are_not_reuploaded() {
    let dir = tempdir().unwrap();
    let data = pattern(5 * MB);
    let source = write_source(dir.path(), "logs.tgz", &data);
    let store = Arc::new(MemoryStore::new());
    store.fail_path("0003");

    let first = UploadSession::prepare(options(dir.path(), source.clone(), 5)).unwrap();
    assert!(first.run(store.clone(), Arc::new(NoopObserver)).await.is_err());

    store.heal();
    let before = store.uploads().len();
    let second = UploadSession::prepare(options(dir.path(), source, 5)).unwrap();
    assert_eq!(
        second.resume_state(),
        &ResumeState::Resumable {
            resume_point: 3,
            logged: 4
        }
    );

    second
        .run(store.clone(), Arc::new(NoopObserver))
        .await
        .unwrap();
    assert_eq!(
        new_uploads(&store, before),
        HashSet::from(["logs.tgz_segments/0003".to_string()])
    );
    let manifest = store.manifest("archive", "logs.tgz").unwrap();
    assert_eq!(store.assemble(&manifest), data);
}

#[tokio::test]
async fn test_failed_commit_keeps_state_and_rerun_only_commits() {
    let dir = tempdir().unwrap();
    let data = pattern(3 * MB);
    let source = write_source(dir.path(), "backup.tar", &data);
    let store = Arc::new(MemoryStore::new());
    store.fail_manifest(3);

    let first = UploadSession::prepare(options(dir.path(), source.clone(), 2)).unwrap();
    let err = first
        .run(store.clone(), Arc::new(NoopObserver))
        .await
        .unwrap_err();
    assert!(matches!(err, SloError::CommitFailed { attempts: 3, .. }));
    assert!(err.is_resumable());
    assert!(first.temp_dir().join("upload_cache").exists());

    let before = store.uploads().len();
    let second = UploadSession::prepare(options(dir.path(), source, 2)).unwrap();
    assert_eq!(
        second.resume_state(),
        &ResumeState::Resumable {
            resume_point: 4,
            logged: 3
        }
    );

    let report = second
        .run(store.clone(), Arc::new(NoopObserver))
        .await
        .unwrap();
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.reused, 3);
    assert_eq!(store.uploads().len(), before);
    assert!(store.manifest("archive", "backup.tar").is_some());
    assert!(!second.temp_dir().exists());
}

#[tokio::test]
async fn test_commit_retries_transient_failures() {
    let dir = tempdir().unwrap();
    let source = write_source(dir.path(), "small.bin", &pattern(1000));
    let store = Arc::new(MemoryStore::new());
    store.fail_manifest(2);

    let session = UploadSession::prepare(options(dir.path(), source, 1)).unwrap();
    let report = session
        .run(store.clone(), Arc::new(NoopObserver))
        .await
        .unwrap();
    assert_eq!(report.total_segments, 1);
    assert!(store.has_container("archive_segments"));
    assert!(store.manifest("archive", "small.bin").is_some());
}

#[tokio::test]
async fn test_mismatched_log_must_be_discarded() {
    let dir = tempdir().unwrap();
    let data = pattern(4 * MB);
    let source = write_source(dir.path(), "scan.raw", &data);
    let store = Arc::new(MemoryStore::new());
    store.fail_path("0004");

    let first = UploadSession::prepare(options(dir.path(), source.clone(), 2)).unwrap();
    assert!(first.run(store.clone(), Arc::new(NoopObserver)).await.is_err());
    store.heal();

    let mut opts = options(dir.path(), source, 2);
    opts.segment_size_mb = 2;
    let mut second = UploadSession::prepare(opts).unwrap();
    assert!(matches!(
        second.resume_state(),
        ResumeState::Mismatched { .. }
    ));

    let err = second
        .run(store.clone(), Arc::new(NoopObserver))
        .await
        .unwrap_err();
    assert!(matches!(err, SloError::SessionMismatch { .. }));

    second.discard_progress().await.unwrap();
    let report = second
        .run(store.clone(), Arc::new(NoopObserver))
        .await
        .unwrap();
    assert_eq!(report.total_segments, 2);
    assert_eq!(report.uploaded, 2);

    let manifest = store.manifest("archive", "scan.raw").unwrap();
    assert_eq!(store.assemble(&manifest), data);
}

#[tokio::test]
async fn test_progress_survives_a_failure_before_the_pool() {
    let dir = tempdir().unwrap();
    let data = pattern(3 * MB);
    let source = write_source(dir.path(), "notes.txt", &data);
    let store = Arc::new(MemoryStore::new());

    // Nothing uploaded yet: a failure leaves no progress
    store.fail_containers();
    let fresh = UploadSession::prepare(options(dir.path(), source.clone(), 2)).unwrap();
    let err = fresh
        .run(store.clone(), Arc::new(NoopObserver))
        .await
        .unwrap_err();
    assert!(matches!(err, SloError::StorageError { .. }));
    assert!(!fresh.has_progress());

    store.heal();
    store.fail_path("0003");
    let first = UploadSession::prepare(options(dir.path(), source.clone(), 2)).unwrap();
    assert!(first.run(store.clone(), Arc::new(NoopObserver)).await.is_err());

    // Same session-level failure, but two segments are already logged
    store.heal();
    store.fail_containers();
    let second = UploadSession::prepare(options(dir.path(), source, 2)).unwrap();
    let err = second
        .run(store.clone(), Arc::new(NoopObserver))
        .await
        .unwrap_err();
    assert!(!err.is_resumable());
    assert!(second.has_progress());
}

#[tokio::test]
async fn test_committed_upload_succeeds_when_cleanup_fails() {
    let dir = tempdir().unwrap();
    let data = pattern(2 * MB + 17);
    let source = write_source(dir.path(), "disk.img", &data);
    let store = Arc::new(MemoryStore::new());

    let session = UploadSession::prepare(options(dir.path(), source, 2)).unwrap();
    // A plain file where the temp directory was makes both removals fail
    let temp_dir = session.temp_dir().to_path_buf();
    store.after_manifest(move || {
        std::fs::remove_dir_all(&temp_dir).unwrap();
        std::fs::write(&temp_dir, b"in the way").unwrap();
    });

    let report = session
        .run(store.clone(), Arc::new(NoopObserver))
        .await
        .unwrap();
    assert_eq!(report.total_segments, 3);
    let manifest = store.manifest("archive", "disk.img").unwrap();
    assert_eq!(store.assemble(&manifest), data);
}
