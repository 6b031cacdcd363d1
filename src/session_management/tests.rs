use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use crate::anonymity::EgressSupervisor;
use crate::configuration::Config;
use crate::container_runtime::testing::MockRuntime;
use crate::container_runtime::ContainerRuntime;
use crate::error_handling::types::SessionError;
use crate::session_management::session::SessionStatus;
use crate::session_management::session_manager::{AttachmentEnd, SessionManager};
use crate::storage::MetadataStore;

struct Fixture {
    manager: Arc<SessionManager>,
    runtime: Arc<MockRuntime>,
    store: Arc<MetadataStore>,
}

async fn fixture() -> Fixture {
    fixture_with(Config::default()).await
}

async fn fixture_with(config: Config) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MetadataStore::connect_in_memory().await.unwrap());
    let runtime = Arc::new(MockRuntime::new());
    let anonymity = Arc::new(EgressSupervisor::with_command(
        39180,
        vec!["true".to_string()],
        store.clone(),
    ));
    let manager = Arc::new(SessionManager::new(
        runtime.clone(),
        store.clone(),
        anonymity,
        config,
    ));
    Fixture {
        manager,
        runtime,
        store,
    }
}

async fn audit_kinds(store: &MetadataStore, id: uuid::Uuid) -> Vec<String> {
    store
        .audit_for_session(id, 50)
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.kind)
        .collect()
}

#[tokio::test]
async fn create_session_reaches_ready_with_container() {
    let f = fixture().await;

    let session = f
        .manager
        .create_session("alice", "alpine:latest")
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Ready);
    assert!(session.container_ref.is_some());
    assert_eq!(f.runtime.running_count(), 1);

    let kinds = audit_kinds(&f.store, session.id).await;
    assert!(kinds.contains(&"session.create".to_string()));
    assert!(kinds.contains(&"session.ready".to_string()));
}

#[tokio::test]
async fn create_failure_fails_session_and_audits() {
    let f = fixture().await;
    f.runtime.fail_create.store(true, Ordering::SeqCst);

    let result = f.manager.create_session("alice", "alpine:latest").await;
    assert!(matches!(result, Err(SessionError::Container(_))));

    // The single row the user has is terminal and carries a fail audit.
    let sessions = f.store.list_by_user("alice", 10).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Terminated);
    assert!(sessions[0].container_ref.is_none());

    let kinds = audit_kinds(&f.store, sessions[0].id).await;
    assert!(kinds.contains(&"session.create".to_string()));
    assert!(kinds.contains(&"session.fail".to_string()));
    assert!(!kinds.contains(&"session.ready".to_string()));
}

#[tokio::test]
async fn quota_rejects_fourth_session() {
    let f = fixture().await;

    for _ in 0..3 {
        f.manager
            .create_session("alice", "alpine:latest")
            .await
            .unwrap();
    }

    let result = f.manager.create_session("alice", "alpine:latest").await;
    assert!(matches!(result, Err(SessionError::QuotaExceeded)));

    // Other users are unaffected.
    assert!(f.manager.create_session("bob", "alpine:latest").await.is_ok());
}

#[tokio::test]
async fn attach_then_detach_keeps_container() {
    let f = fixture().await;
    let session = f
        .manager
        .create_session("alice", "alpine:latest")
        .await
        .unwrap();
    let container_ref = session.container_ref.clone().unwrap();

    let attached = f.manager.attach(session.id).await.unwrap();
    assert_eq!(attached.session.status, SessionStatus::Attached);

    // A second bridge must not claim the same session.
    let second = f.manager.attach(session.id).await;
    assert!(matches!(second, Err(SessionError::NotAttachable(_))));

    f.manager
        .finish_attachment(session.id, AttachmentEnd::Detached)
        .await;

    let detached = f.manager.get_session(session.id).await.unwrap();
    assert_eq!(detached.status, SessionStatus::Detached);
    assert_eq!(detached.container_ref.as_deref(), Some(container_ref.as_str()));
    assert!(detached.expires_at.is_some());

    // Reattach within grace binds the same container.
    let reattached = f.manager.attach(session.id).await.unwrap();
    assert_eq!(
        reattached.session.container_ref.as_deref(),
        Some(container_ref.as_str())
    );
}

#[tokio::test]
async fn violation_detach_terminates_session() {
    let f = fixture().await;
    let session = f
        .manager
        .create_session("alice", "alpine:latest")
        .await
        .unwrap();

    f.manager.attach(session.id).await.unwrap();
    f.manager
        .finish_attachment(session.id, AttachmentEnd::SecurityViolation)
        .await;

    let ended = f.manager.get_session(session.id).await.unwrap();
    assert_eq!(ended.status, SessionStatus::Terminated);
    assert_eq!(f.runtime.running_count(), 0);
}

#[tokio::test]
async fn detach_with_dead_container_terminates() {
    let f = fixture().await;
    let session = f
        .manager
        .create_session("alice", "alpine:latest")
        .await
        .unwrap();
    let container_ref = session.container_ref.clone().unwrap();

    f.manager.attach(session.id).await.unwrap();
    // Simulate the container dying while attached.
    f.runtime.stop(&container_ref, 0).await.unwrap();

    f.manager
        .finish_attachment(session.id, AttachmentEnd::Detached)
        .await;

    let ended = f.manager.get_session(session.id).await.unwrap();
    assert_eq!(ended.status, SessionStatus::Terminated);

    let kinds = audit_kinds(&f.store, session.id).await;
    assert!(kinds.contains(&"session.terminate".to_string()));
}

#[tokio::test]
async fn sweeper_evicts_expired_detached_sessions() {
    let f = fixture().await;
    let session = f
        .manager
        .create_session("alice", "alpine:latest")
        .await
        .unwrap();

    f.manager.attach(session.id).await.unwrap();
    f.manager
        .finish_attachment(session.id, AttachmentEnd::Detached)
        .await;

    // Not yet expired: nothing happens.
    f.manager.sweep_once(Utc::now()).await;
    assert_eq!(
        f.manager.get_session(session.id).await.unwrap().status,
        SessionStatus::Detached
    );

    // Past the idle TTL the sweeper terminates it. Sweeping with a
    // far-future clock also passes the audit grace, so the row is
    // deleted in the same pass.
    let future = Utc::now() + ChronoDuration::seconds(601);
    f.manager.sweep_once(future).await;

    assert!(matches!(
        f.manager.get_session(session.id).await,
        Err(SessionError::NotFound)
    ));
    assert_eq!(f.runtime.running_count(), 0);

    let kinds = audit_kinds(&f.store, session.id).await;
    let terminates = kinds.iter().filter(|k| *k == "session.terminate").count();
    assert_eq!(terminates, 1);
}

#[tokio::test]
async fn sweeper_evicts_never_attached_ready_sessions() {
    let f = fixture().await;
    let session = f
        .manager
        .create_session("alice", "alpine:latest")
        .await
        .unwrap();

    let future = Utc::now() + ChronoDuration::seconds(121);
    f.manager.sweep_once(future).await;

    assert_eq!(f.runtime.running_count(), 0);
    let kinds = audit_kinds(&f.store, session.id).await;
    assert!(kinds.contains(&"session.terminate".to_string()));
}

#[tokio::test]
async fn sweeper_deletes_terminated_rows_after_grace() {
    let f = fixture().await;
    let session = f
        .manager
        .create_session("alice", "alpine:latest")
        .await
        .unwrap();
    f.manager.delete_session(session.id).await.unwrap();

    // Within the audit grace the row survives.
    f.manager.sweep_once(Utc::now()).await;
    assert!(f.manager.get_session(session.id).await.is_ok());

    let future = Utc::now() + ChronoDuration::seconds(61);
    f.manager.sweep_once(future).await;
    assert!(matches!(
        f.manager.get_session(session.id).await,
        Err(SessionError::NotFound)
    ));
}

#[tokio::test]
async fn delete_is_idempotent_on_terminated() {
    let f = fixture().await;
    let session = f
        .manager
        .create_session("alice", "alpine:latest")
        .await
        .unwrap();

    f.manager.delete_session(session.id).await.unwrap();
    let first = f.manager.get_session(session.id).await.unwrap();
    assert_eq!(first.status, SessionStatus::Terminated);

    // Second delete is a no-op success.
    f.manager.delete_session(session.id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cleanup_exhaustion_fails_session_and_leaks_to_reaper() {
    let f = fixture().await;
    let session = f
        .manager
        .create_session("alice", "alpine:latest")
        .await
        .unwrap();

    f.runtime.fail_stop.store(true, Ordering::SeqCst);
    let result = f.manager.delete_session(session.id).await;
    assert!(result.is_err());

    let failed = f.manager.get_session(session.id).await.unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);
    // The handle stays recorded for the orphan reaper.
    assert!(failed.container_ref.is_some());

    let kinds = audit_kinds(&f.store, session.id).await;
    assert!(kinds.contains(&"session.fail".to_string()));
}

#[tokio::test]
async fn recovery_reconciles_stranded_sessions() {
    let f = fixture().await;

    // A session that looks Attached from a previous process whose
    // container still runs.
    let alive = f
        .manager
        .create_session("alice", "alpine:latest")
        .await
        .unwrap();
    f.manager.attach(alive.id).await.unwrap();

    // One whose container died with the old process.
    let dead = f
        .manager
        .create_session("bob", "alpine:latest")
        .await
        .unwrap();
    f.manager.attach(dead.id).await.unwrap();
    let dead_ref = f
        .manager
        .get_session(dead.id)
        .await
        .unwrap()
        .container_ref
        .unwrap();
    f.runtime.stop(&dead_ref, 0).await.unwrap();

    let reconciled = f.manager.recover().await.unwrap();
    assert_eq!(reconciled, 2);

    let recovered_alive = f.manager.get_session(alive.id).await.unwrap();
    assert_eq!(recovered_alive.status, SessionStatus::Detached);
    assert!(recovered_alive.expires_at.is_some());

    let recovered_dead = f.manager.get_session(dead.id).await.unwrap();
    assert_eq!(recovered_dead.status, SessionStatus::Terminated);
}

#[tokio::test]
async fn terminated_sessions_free_quota() {
    let mut config = Config::default();
    config.max_sessions_per_user = 1;
    let f = fixture_with(config).await;

    let first = f
        .manager
        .create_session("alice", "alpine:latest")
        .await
        .unwrap();
    assert!(matches!(
        f.manager.create_session("alice", "alpine:latest").await,
        Err(SessionError::QuotaExceeded)
    ));

    f.manager.delete_session(first.id).await.unwrap();
    assert!(f.manager.create_session("alice", "alpine:latest").await.is_ok());
}
