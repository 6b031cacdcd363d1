//! Session lifecycle management.
//!
//! The manager composes the container runtime and the metadata store,
//! drives every status transition through compare-and-set, and runs the
//! background sweeper that retires expired sessions. It holds no
//! per-session lock beyond a transition; the only in-memory state is the
//! registry of cancel handles for currently-bound bridges.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::time::{interval, sleep, timeout};
use uuid::Uuid;

use crate::anonymity::EgressSupervisor;
use crate::configuration::Config;
use crate::container_runtime::types::{ContainerSpec, PtySize};
use crate::container_runtime::{ContainerRuntime, PtyHandle};
use crate::error_handling::types::{ContainerError, SessionError, StorageError};
use crate::session_management::session::{Session, SessionStatus};
use crate::storage::types::{AuditKind, MetricSample};
use crate::storage::MetadataStore;

/// Maximum attempts for the stop+remove cleanup of one container.
const CLEANUP_MAX_ATTEMPTS: u32 = 5;
/// Initial backoff between cleanup attempts; doubles up to the cap.
const CLEANUP_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const CLEANUP_BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Grace handed to the engine for SIGTERM before SIGKILL.
const STOP_GRACE_SECS: i64 = 10;
/// Pause between readiness probes during provisioning.
const READY_PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// How an attachment ended, as reported by the transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentEnd {
    /// Client went away or the shell exited; the container may live on.
    Detached,
    /// The bridge tore the session down over a protocol violation.
    SecurityViolation,
}

/// Everything a transport endpoint needs to run a bridge.
pub struct AttachedSession {
    pub session: Session,
    pub pty: PtyHandle,
    /// Signaled by the manager when an operator deletes the session.
    pub cancel: Arc<Notify>,
}

pub struct SessionManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<MetadataStore>,
    anonymity: Arc<EgressSupervisor>,
    config: Config,
    /// Cancel handles of currently-bound bridges, keyed by session.
    cancels: RwLock<HashMap<Uuid, Arc<Notify>>>,
}

impl SessionManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<MetadataStore>,
        anonymity: Arc<EgressSupervisor>,
        config: Config,
    ) -> Self {
        Self {
            runtime,
            store,
            anonymity,
            config,
            cancels: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<MetadataStore> {
        self.store.clone()
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Creates a session and provisions its container, returning only
    /// once the session is Ready (or the create budget is spent).
    pub async fn create_session(
        &self,
        user_id: &str,
        image: &str,
    ) -> Result<Session, SessionError> {
        let live = self.store.count_live_by_user(user_id).await?;
        if live >= self.config.max_sessions_per_user {
            return Err(SessionError::QuotaExceeded);
        }

        let now = Utc::now();
        let session = Session::new(
            user_id.to_string(),
            image.to_string(),
            self.config.resource_limits,
            now,
        );
        let id = session.id;
        self.store.insert_session(&session).await?;
        self.audit(
            Some(id),
            user_id,
            AuditKind::SessionCreate,
            serde_json::json!({"image": image}),
        )
        .await;

        let name = container_name(id);
        let provisioned = timeout(
            self.config.create_timeout,
            self.provision(&session, &name),
        )
        .await;

        match provisioned {
            Ok(Ok(container_ref)) => {
                let ready = self
                    .store
                    .mark_ready(id, &container_ref, Utc::now())
                    .await?;
                self.audit(
                    Some(id),
                    user_id,
                    AuditKind::SessionReady,
                    serde_json::json!({"container_ref": container_ref}),
                )
                .await;
                info!("Session {} ready for user {}", id, user_id);
                Ok(ready)
            }
            Ok(Err(e)) => {
                warn!("Session {} provisioning failed: {}", id, e);
                self.fail_creation(id, user_id, &name, &e.to_string()).await;
                Err(e.into())
            }
            Err(_) => {
                warn!(
                    "Session {} provisioning exceeded {:?}",
                    id, self.config.create_timeout
                );
                self.fail_creation(id, user_id, &name, "create timeout").await;
                Err(SessionError::CreateTimeout)
            }
        }
    }

    /// Pull, create, start, then probe the container until a shell
    /// responds. The caller bounds the whole sequence with the create
    /// timeout.
    async fn provision(
        &self,
        session: &Session,
        name: &str,
    ) -> Result<String, ContainerError> {
        self.runtime.ensure_image(&session.image).await?;

        let spec = ContainerSpec {
            name: name.to_string(),
            image: session.image.clone(),
            limits: session.resource_limits,
            env: self.container_env(),
            cmd: init_command(),
        };

        let container_ref = self.runtime.create(&spec).await?;
        self.runtime.start(&container_ref).await?;

        loop {
            match self
                .runtime
                .exec_capture(&container_ref, &ready_probe_argv())
                .await
            {
                Ok(output) if output.contains("ok") => break,
                Ok(_) => {}
                Err(e) => debug!("Ready probe for {} not up yet: {}", name, e),
            }
            sleep(READY_PROBE_INTERVAL).await;
        }

        Ok(container_ref)
    }

    async fn fail_creation(&self, id: Uuid, user_id: &str, name: &str, reason: &str) {
        // The container may exist under its name even if creation was
        // interrupted before the engine handed back a reference.
        let removed = self.runtime.remove(name, true).await;

        let now = Utc::now();
        let cleaned = removed.is_ok();
        if let Err(e) = self
            .store
            .mark_failed(id, SessionStatus::Creating, cleaned, now)
            .await
        {
            error!("Failed to mark session {} failed: {}", id, e);
        }
        self.audit(
            Some(id),
            user_id,
            AuditKind::SessionFail,
            serde_json::json!({"reason": reason}),
        )
        .await;

        if cleaned {
            if let Err(e) = self
                .store
                .update_status(id, SessionStatus::Failed, SessionStatus::Terminated, now)
                .await
            {
                error!("Failed to finalize failed session {}: {}", id, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Attach / detach
    // ------------------------------------------------------------------

    /// Claims the session for one bridge (`Ready|Detached -> Attached`)
    /// and execs a fresh interactive shell into its container.
    pub async fn attach(&self, id: Uuid) -> Result<AttachedSession, SessionError> {
        let session = self
            .store
            .get_session(id)
            .await?
            .ok_or(SessionError::NotFound)?;

        if !session.status.is_attachable() {
            return Err(SessionError::NotAttachable(session.status.to_string()));
        }

        let attached = self
            .store
            .mark_attached(id, session.status, Utc::now())
            .await
            .map_err(|e| match e {
                // Lost the claim race against another bridge or the sweeper.
                StorageError::StalePrecondition => {
                    SessionError::NotAttachable(session.status.to_string())
                }
                other => SessionError::Storage(other),
            })?;

        let container_ref = match attached.container_ref.clone() {
            Some(container_ref) => container_ref,
            None => {
                return Err(SessionError::NotAttachable(
                    "no container bound".to_string(),
                ));
            }
        };

        match self
            .runtime
            .exec_pty(
                &container_ref,
                &shell_argv(),
                &self.container_env(),
                PtySize::default(),
            )
            .await
        {
            Ok(pty) => {
                let cancel = Arc::new(Notify::new());
                self.cancels.write().await.insert(id, cancel.clone());
                self.audit(
                    Some(id),
                    &attached.user_id,
                    AuditKind::SessionAttach,
                    serde_json::json!({"container_ref": container_ref}),
                )
                .await;
                debug!("Session {} attached", id);
                Ok(AttachedSession {
                    session: attached,
                    pty,
                    cancel,
                })
            }
            Err(e) => {
                warn!("PTY exec failed for session {}: {}", id, e);
                if let Err(err) = self
                    .terminate_from(id, SessionStatus::Attached, "exec_failed")
                    .await
                {
                    error!("Teardown after exec failure on {}: {}", id, err);
                }
                Err(e.into())
            }
        }
    }

    /// Restores session state after a bridge finished. Errors are
    /// logged, never propagated: the bridge has already closed.
    pub async fn finish_attachment(&self, id: Uuid, end: AttachmentEnd) {
        self.cancels.write().await.remove(&id);

        let session = match self.store.get_session(id).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to load session {} after detach: {}", id, e);
                return;
            }
        };
        if session.status != SessionStatus::Attached {
            // An operator delete or the sweeper got there first.
            return;
        }

        let container_alive = match &session.container_ref {
            Some(container_ref) => self
                .runtime
                .is_running(container_ref)
                .await
                .unwrap_or(false),
            None => false,
        };

        let terminate_reason = match end {
            AttachmentEnd::SecurityViolation => Some("security_violation"),
            AttachmentEnd::Detached if !container_alive => Some("container_exit"),
            AttachmentEnd::Detached => None,
        };

        match terminate_reason {
            Some(reason) => {
                if let Err(e) = self
                    .terminate_from(id, SessionStatus::Attached, reason)
                    .await
                {
                    error!("Termination of session {} failed: {}", id, e);
                }
            }
            None => {
                let now = Utc::now();
                let expires = now + chrono_dur(self.config.idle_ttl);
                match self
                    .store
                    .mark_detached(id, SessionStatus::Attached, expires, now)
                    .await
                {
                    Ok(_) => {
                        self.audit(
                            Some(id),
                            &session.user_id,
                            AuditKind::SessionDetach,
                            serde_json::json!({"expires_at": expires.to_rfc3339()}),
                        )
                        .await;
                        debug!("Session {} detached until {}", id, expires);
                    }
                    Err(StorageError::StalePrecondition) => {}
                    Err(e) => error!("Failed to detach session {}: {}", id, e),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries and deletion
    // ------------------------------------------------------------------

    pub async fn get_session(&self, id: Uuid) -> Result<Session, SessionError> {
        self.store
            .get_session(id)
            .await?
            .ok_or(SessionError::NotFound)
    }

    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, SessionError> {
        Ok(self.store.list_by_user(user_id, 100).await?)
    }

    /// Terminates a session on operator request. Idempotent for sessions
    /// that are already terminal or on their way down.
    pub async fn delete_session(&self, id: Uuid) -> Result<(), SessionError> {
        // The bridge may detach concurrently; retry the claim a few
        // times against the then-current status.
        for _ in 0..3 {
            let session = self
                .store
                .get_session(id)
                .await?
                .ok_or(SessionError::NotFound)?;

            match session.status {
                SessionStatus::Terminated | SessionStatus::Terminating => return Ok(()),
                SessionStatus::Failed => {
                    let _ = self
                        .store
                        .update_status(
                            id,
                            SessionStatus::Failed,
                            SessionStatus::Terminated,
                            Utc::now(),
                        )
                        .await;
                    return Ok(());
                }
                SessionStatus::Creating => {
                    return Err(SessionError::NotAttachable("Creating".to_string()));
                }
                status @ (SessionStatus::Ready
                | SessionStatus::Attached
                | SessionStatus::Detached) => {
                    if status == SessionStatus::Attached {
                        if let Some(cancel) = self.cancels.read().await.get(&id) {
                            cancel.notify_one();
                        }
                    }
                    match self.terminate_from(id, status, "operator_delete").await {
                        Ok(()) => return Ok(()),
                        Err(SessionError::Storage(StorageError::StalePrecondition)) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Err(SessionError::NotAttachable("status churn".to_string()))
    }

    // ------------------------------------------------------------------
    // Termination internals
    // ------------------------------------------------------------------

    async fn terminate_from(
        &self,
        id: Uuid,
        from: SessionStatus,
        reason: &str,
    ) -> Result<(), SessionError> {
        let session = self
            .store
            .update_status(id, from, SessionStatus::Terminating, Utc::now())
            .await?;
        self.teardown(session, reason).await
    }

    /// Stops and removes the container of a Terminating session, then
    /// finalizes the row. On exhausted retries the session goes to
    /// Failed and the container is left to the engine's orphan reaper.
    async fn teardown(&self, session: Session, reason: &str) -> Result<(), SessionError> {
        let id = session.id;

        if let Some(container_ref) = &session.container_ref {
            if let Err(e) = self.retry_cleanup(container_ref).await {
                error!(
                    "Cleanup of container {} for session {} exhausted: {}",
                    container_ref, id, e
                );
                let _ = self
                    .store
                    .mark_failed(id, SessionStatus::Terminating, false, Utc::now())
                    .await;
                self.audit(
                    Some(id),
                    &session.user_id,
                    AuditKind::SessionFail,
                    serde_json::json!({"reason": "cleanup_exhausted"}),
                )
                .await;
                return Err(e.into());
            }
        }

        self.store
            .mark_terminated(id, SessionStatus::Terminating, Utc::now())
            .await?;
        self.audit(
            Some(id),
            &session.user_id,
            AuditKind::SessionTerminate,
            serde_json::json!({"reason": reason}),
        )
        .await;
        info!("Session {} terminated ({})", id, reason);
        Ok(())
    }

    async fn retry_cleanup(&self, container_ref: &str) -> Result<(), ContainerError> {
        let mut delay = CLEANUP_BACKOFF_INITIAL;
        let mut last_error = None;

        for attempt in 1..=CLEANUP_MAX_ATTEMPTS {
            let result = async {
                self.runtime.stop(container_ref, STOP_GRACE_SECS).await?;
                self.runtime.remove(container_ref, true).await
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Cleanup attempt {}/{} for {} failed: {}",
                        attempt, CLEANUP_MAX_ATTEMPTS, container_ref, e
                    );
                    last_error = Some(e);
                    if attempt < CLEANUP_MAX_ATTEMPTS {
                        sleep(delay).await;
                        delay = (delay * 2).min(CLEANUP_BACKOFF_CAP);
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ContainerError::ApiError("cleanup never attempted".to_string())))
    }

    // ------------------------------------------------------------------
    // Background sweeper
    // ------------------------------------------------------------------

    /// Runs the sweeper until the shutdown channel fires.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.sweep_interval);
        let mut tick: u64 = 0;
        info!(
            "Sweeper running every {:?} (idle TTL {:?})",
            self.config.sweep_interval, self.config.idle_ttl
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tick += 1;
                    self.sweep_once(Utc::now()).await;
                    if tick % 3 == 0 {
                        self.sample_metrics().await;
                    }
                    if tick % 60 == 0 {
                        if let Err(e) = self.store.purge_expired(Utc::now()).await {
                            error!("Retention purge failed: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Sweeper stopping");
                    break;
                }
            }
        }
    }

    /// One sweep pass: evict expired detached sessions, never-attached
    /// Ready sessions past grace, and terminated rows past the audit
    /// window.
    pub async fn sweep_once(&self, now: DateTime<Utc>) {
        match self.store.expired_detached(now).await {
            Ok(ids) => {
                for id in ids {
                    self.evict(id, SessionStatus::Detached, "idle_expired", now)
                        .await;
                }
            }
            Err(e) => error!("Sweeper query for expired sessions failed: {}", e),
        }

        let ready_cutoff = now - chrono_dur(self.config.ready_grace);
        match self.store.expired_ready(ready_cutoff).await {
            Ok(ids) => {
                for id in ids {
                    self.evict(id, SessionStatus::Ready, "never_attached", now)
                        .await;
                }
            }
            Err(e) => error!("Sweeper query for stale ready sessions failed: {}", e),
        }

        let audit_cutoff = now - chrono_dur(self.config.audit_grace);
        match self.store.stale_terminated(audit_cutoff).await {
            Ok(ids) => {
                for id in ids {
                    if let Err(e) = self.store.delete(id).await {
                        error!("Failed to delete terminated session {}: {}", id, e);
                    } else {
                        debug!("Deleted terminated session {} past audit grace", id);
                    }
                }
            }
            Err(e) => error!("Sweeper query for stale terminated rows failed: {}", e),
        }
    }

    async fn evict(&self, id: Uuid, from: SessionStatus, reason: &str, now: DateTime<Utc>) {
        match self
            .store
            .update_status(id, from, SessionStatus::Terminating, now)
            .await
        {
            Ok(session) => {
                if let Err(e) = self.teardown(session, reason).await {
                    error!("Eviction teardown of {} failed: {}", id, e);
                }
            }
            // A reattach or operator delete won the race.
            Err(StorageError::StalePrecondition) => {}
            Err(e) => error!("Eviction claim on {} failed: {}", id, e),
        }
    }

    async fn sample_metrics(&self) {
        let sessions = match self
            .store
            .sessions_with_status(&[
                SessionStatus::Ready,
                SessionStatus::Attached,
                SessionStatus::Detached,
            ])
            .await
        {
            Ok(sessions) => sessions,
            Err(e) => {
                debug!("Metrics query failed: {}", e);
                return;
            }
        };

        for session in sessions {
            let Some(container_ref) = &session.container_ref else {
                continue;
            };
            match self.runtime.sample_stats(container_ref).await {
                Ok(sample) => {
                    let metric = MetricSample {
                        session_id: session.id,
                        cpu_percent: sample.cpu_percent,
                        memory_usage_bytes: sample.memory_usage_bytes,
                        memory_limit_bytes: sample.memory_limit_bytes,
                    };
                    if let Err(e) = self.store.append_metrics(&metric, Utc::now()).await {
                        debug!("Metrics append for {} failed: {}", session.id, e);
                    }
                }
                Err(e) => debug!("Stats sample for {} failed: {}", session.id, e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Crash recovery and shutdown
    // ------------------------------------------------------------------

    /// Reconciles rows stranded by a previous process: live containers
    /// become Detached (no client is bound after a restart), dead ones
    /// go straight to Terminated.
    pub async fn recover(&self) -> Result<usize, SessionError> {
        let stranded = self
            .store
            .sessions_with_status(&[
                SessionStatus::Creating,
                SessionStatus::Attached,
                SessionStatus::Terminating,
            ])
            .await?;

        let count = stranded.len();
        let now = Utc::now();

        for session in stranded {
            let alive = match &session.container_ref {
                Some(container_ref) => self
                    .runtime
                    .is_running(container_ref)
                    .await
                    .unwrap_or(false),
                None => false,
            };

            if alive {
                let expires = now + chrono_dur(self.config.idle_ttl);
                if let Err(e) = self
                    .store
                    .mark_detached(session.id, session.status, expires, now)
                    .await
                {
                    error!("Recovery detach of {} failed: {}", session.id, e);
                } else {
                    info!("Recovered session {} as Detached", session.id);
                }
            } else {
                if let Err(e) = self
                    .store
                    .mark_terminated(session.id, session.status, now)
                    .await
                {
                    error!("Recovery terminate of {} failed: {}", session.id, e);
                } else {
                    self.audit(
                        Some(session.id),
                        &session.user_id,
                        AuditKind::SessionTerminate,
                        serde_json::json!({"reason": "recovered_dead"}),
                    )
                    .await;
                    info!("Recovered session {} as Terminated", session.id);
                }
            }
        }

        Ok(count)
    }

    /// Signals every bound bridge to close; used on process shutdown.
    pub async fn shutdown(&self) {
        for cancel in self.cancels.read().await.values() {
            cancel.notify_one();
        }
    }

    async fn audit(
        &self,
        session_id: Option<Uuid>,
        user_id: &str,
        kind: AuditKind,
        payload: serde_json::Value,
    ) {
        if let Err(e) = self
            .store
            .append_audit(session_id, user_id, kind, payload, Utc::now())
            .await
        {
            error!("Failed to write {} audit: {}", kind, e);
        }
    }

    fn container_env(&self) -> Vec<String> {
        let mut env = vec![
            "TERM=xterm-256color".to_string(),
            "LANG=C.UTF-8".to_string(),
            "LC_ALL=C.UTF-8".to_string(),
            "DEBIAN_FRONTEND=noninteractive".to_string(),
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            "HOME=/root".to_string(),
        ];

        if self.anonymity.is_enabled() {
            let proxy = format!(
                "socks5h://host.docker.internal:{}",
                self.anonymity.socks_port()
            );
            env.push(format!("ALL_PROXY={}", proxy));
            env.push(format!("all_proxy={}", proxy));
        }

        env
    }
}

/// Engine-facing container name for a session.
pub fn container_name(id: Uuid) -> String {
    let hex = id.simple().to_string();
    format!("hublot-session-{}", &hex[..12])
}

/// Init command keeping PID 1 alive for the container's lifetime.
fn init_command() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "while true; do sleep 3600; done".to_string(),
    ]
}

/// Interactive shell exec'd per attach; falls back to sh on images
/// without bash.
fn shell_argv() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "command -v bash >/dev/null 2>&1 && exec bash -i || exec sh -i".to_string(),
    ]
}

fn ready_probe_argv() -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), "echo ok".to_string()]
}

fn chrono_dur(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(0))
}
