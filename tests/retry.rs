// tests/retry.rs

//! Lock-conflict retry of whole calls.

mod common;

use common::{TestRepo, V1, acl, change_set, tuple};
use conary_reposerver::{Error, RepositoryServer};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Fail the first `failures` attempts of `method` with a lock conflict
fn inject_conflicts(repo: TestRepo, method: &'static str, failures: u32, attempts: Arc<AtomicU32>) -> TestRepo {
    let TestRepo { dir, server } = repo;
    let server: RepositoryServer = server.with_attempt_hook(Box::new(move |name, attempt| {
        if name != method {
            return Ok(());
        }
        attempts.fetch_add(1, Ordering::SeqCst);
        if attempt <= failures {
            Err(Error::LockConflict("injected".to_string()))
        } else {
            Ok(())
        }
    }));
    TestRepo { dir, server }
}

#[test]
fn test_commit_succeeds_on_last_attempt() {
    let attempts = Arc::new(AtomicU32::new(0));
    let repo = TestRepo::with_config(|c| c.deadlock_retry = 4);
    let writer = repo.add_user_with_acl("writer", acl(None, None, true));
    let repo = inject_conflicts(repo, "commitChangeSet", 3, attempts.clone());

    let before = repo.current_change();
    repo.commit(&writer, &change_set("foo", V1, &[])).unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(repo.current_change(), before + 1);
    let present = repo
        .call("hasTroves", &writer, json!({"troves": [tuple("foo", V1)]}))
        .unwrap();
    assert_eq!(present, json!([true]));
}

#[test]
fn test_exhausted_commit_reports_locked_cause() {
    let attempts = Arc::new(AtomicU32::new(0));
    let repo = TestRepo::with_config(|c| c.deadlock_retry = 3);
    let writer = repo.add_user_with_acl("writer", acl(None, None, true));
    let repo = inject_conflicts(repo, "commitChangeSet", u32::MAX, attempts.clone());

    let before = repo.current_change();
    let err = repo.commit(&writer, &change_set("foo", V1, &[])).unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    match err {
        Error::CommitFailed { cause: Some(cause), .. } => {
            assert!(matches!(*cause, Error::RepositoryLocked));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(repo.current_change(), before);
}

#[test]
fn test_exhausted_query_reports_locked() {
    let attempts = Arc::new(AtomicU32::new(0));
    let repo = TestRepo::with_config(|c| c.deadlock_retry = 2);
    let repo = inject_conflicts(repo, "troveNames", u32::MAX, attempts.clone());

    let err = repo
        .call("troveNames", &repo.admin(), serde_json::Value::Null)
        .unwrap_err();
    assert!(matches!(err, Error::RepositoryLocked));
    assert_eq!(err.kind(), "RepositoryLocked");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
