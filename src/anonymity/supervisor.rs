//! Supervisor for the anonymizing SOCKS5 egress proxy.
//!
//! The supervisor owns one subprocess (the Anyone Protocol client by
//! default), probes its listen port for readiness, and watches it for
//! crashes while enabled. It never routes traffic itself; the container
//! runtime injects the proxy address into session containers while
//! anonymity is on.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout};

use crate::error_handling::types::ProxyError;
use crate::storage::types::AuditKind;
use crate::storage::MetadataStore;

/// Total budget for the readiness probe after spawn.
const READY_BUDGET: Duration = Duration::from_secs(3);
/// Pause between readiness probe attempts.
const READY_PROBE_INTERVAL: Duration = Duration::from_millis(250);
/// Grace between SIGTERM and SIGKILL on disable.
const TERM_GRACE: Duration = Duration::from_secs(2);
/// Cadence of the crash monitor while enabled.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Snapshot returned by [`EgressSupervisor::status`].
#[derive(Debug, Clone, Serialize)]
pub struct AnonymityStatus {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socks_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProxyState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed(String),
}

pub struct EgressSupervisor {
    socks_port: u16,
    command: Vec<String>,
    store: Arc<MetadataStore>,
    /// Lock-free snapshot read by `status()`.
    enabled: AtomicBool,
    state: RwLock<ProxyState>,
    process: Mutex<Option<Child>>,
    /// Serializes enable/disable (and the monitor's failure handling).
    op_lock: Mutex<()>,
    monitor_started: AtomicBool,
}

impl EgressSupervisor {
    pub fn new(socks_port: u16, store: Arc<MetadataStore>) -> Self {
        let command = vec![
            "npx".to_string(),
            "--yes".to_string(),
            "@anyone-protocol/anyone-client".to_string(),
            "-s".to_string(),
            socks_port.to_string(),
        ];
        Self::with_command(socks_port, command, store)
    }

    /// Constructor with an explicit proxy command line; used by tests.
    pub fn with_command(socks_port: u16, command: Vec<String>, store: Arc<MetadataStore>) -> Self {
        Self {
            socks_port,
            command,
            store,
            enabled: AtomicBool::new(false),
            state: RwLock::new(ProxyState::Stopped),
            process: Mutex::new(None),
            op_lock: Mutex::new(()),
            monitor_started: AtomicBool::new(false),
        }
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> AnonymityStatus {
        let enabled = self.is_enabled();
        AnonymityStatus {
            enabled,
            socks_port: enabled.then_some(self.socks_port),
        }
    }

    pub async fn state(&self) -> ProxyState {
        self.state.read().await.clone()
    }

    /// Starts the proxy subprocess and waits for the SOCKS port to come
    /// up. A no-op when already enabled.
    pub async fn enable(self: Arc<Self>) -> Result<AnonymityStatus, ProxyError> {
        let _guard = self.op_lock.lock().await;

        if self.is_enabled() {
            return Ok(self.status());
        }

        info!(
            "Enabling anonymizing egress on 127.0.0.1:{}",
            self.socks_port
        );
        *self.state.write().await = ProxyState::Starting;

        let child = self.spawn_proxy()?;
        let pid = child.id();
        *self.process.lock().await = Some(child);

        match self.wait_for_ready().await {
            Ok(()) => {
                self.enabled.store(true, Ordering::SeqCst);
                *self.state.write().await = ProxyState::Running;
                self.audit(
                    AuditKind::PrivacyEnable,
                    serde_json::json!({"socks_port": self.socks_port, "pid": pid}),
                )
                .await;
                Self::ensure_monitor(&self);
                info!("Anonymizing egress ready on port {}", self.socks_port);
                Ok(self.status())
            }
            Err(e) => {
                warn!("Egress proxy failed readiness probe: {}", e);
                self.kill_process().await;
                *self.state.write().await = ProxyState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Stops the proxy subprocess. A no-op when already stopped.
    pub async fn disable(&self) -> Result<AnonymityStatus, ProxyError> {
        let _guard = self.op_lock.lock().await;

        let child = self.process.lock().await.take();
        let was_enabled = self.enabled.swap(false, Ordering::SeqCst);

        if let Some(mut child) = child {
            *self.state.write().await = ProxyState::Stopping;

            if let Some(pid) = child.id() {
                // SIGTERM first; the runtime handle only offers SIGKILL.
                let _ = Command::new("kill")
                    .arg("-TERM")
                    .arg(pid.to_string())
                    .status()
                    .await;
            }

            match timeout(TERM_GRACE, child.wait()).await {
                Ok(Ok(exit)) => debug!("Egress proxy exited with {}", exit),
                Ok(Err(e)) => warn!("Error waiting for egress proxy: {}", e),
                Err(_) => {
                    warn!("Egress proxy ignored SIGTERM, killing");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }

        *self.state.write().await = ProxyState::Stopped;

        if was_enabled {
            self.audit(
                AuditKind::PrivacyDisable,
                serde_json::json!({"reason": "operator_request"}),
            )
            .await;
            info!("Anonymizing egress disabled");
        }

        Ok(self.status())
    }

    fn spawn_proxy(&self) -> Result<Child, ProxyError> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ProxyError::SpawnFailed(format!("{}: {}", self.command[0], e)))?;

        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[egress-proxy][stderr] {}", line);
                }
            });
        }
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[egress-proxy] {}", line);
                }
            });
        }

        debug!("Spawned egress proxy, pid {:?}", child.id());
        Ok(child)
    }

    async fn wait_for_ready(&self) -> Result<(), ProxyError> {
        let deadline = tokio::time::Instant::now() + READY_BUDGET;

        while tokio::time::Instant::now() < deadline {
            if self.probe().await {
                return Ok(());
            }
            sleep(READY_PROBE_INTERVAL).await;
        }

        Err(ProxyError::NotReady(format!(
            "port {} unreachable after {:?}",
            self.socks_port, READY_BUDGET
        )))
    }

    async fn probe(&self) -> bool {
        let addr = ("127.0.0.1", self.socks_port);
        matches!(
            timeout(Duration::from_secs(1), tokio::net::TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    async fn kill_process(&self) {
        if let Some(mut child) = self.process.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }

    /// Spawns the crash monitor once per supervisor.
    fn ensure_monitor(this: &Arc<Self>) {
        if this.monitor_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let supervisor = Arc::clone(this);
        tokio::spawn(async move {
            loop {
                sleep(MONITOR_INTERVAL).await;
                if !supervisor.is_enabled() {
                    continue;
                }
                if supervisor.probe().await {
                    continue;
                }

                let _guard = supervisor.op_lock.lock().await;
                // Re-check under the lock: a concurrent disable may have
                // already handled the subprocess.
                if !supervisor.is_enabled() {
                    continue;
                }

                warn!(
                    "Egress proxy on port {} stopped responding, marking failed",
                    supervisor.socks_port
                );
                supervisor.enabled.store(false, Ordering::SeqCst);
                supervisor.kill_process().await;
                *supervisor.state.write().await =
                    ProxyState::Failed("readiness probe failed".to_string());
                supervisor
                    .audit(
                        AuditKind::PrivacyDisable,
                        serde_json::json!({"reason": "probe_failed"}),
                    )
                    .await;
            }
        });
    }

    async fn audit(&self, kind: AuditKind, payload: serde_json::Value) {
        if let Err(e) = self
            .store
            .append_audit(None, "system", kind, payload, Utc::now())
            .await
        {
            debug!("Failed to record {} audit: {}", kind, e);
        }
    }
}

impl Drop for EgressSupervisor {
    fn drop(&mut self) {
        // kill_on_drop handles the child; nothing async-safe to do here.
        if self.enabled.load(Ordering::SeqCst) {
            warn!("EgressSupervisor dropped while enabled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn supervisor(command: Vec<String>) -> Arc<EgressSupervisor> {
        let store = Arc::new(MetadataStore::connect_in_memory().await.unwrap());
        Arc::new(EgressSupervisor::with_command(39181, command, store))
    }

    #[tokio::test]
    async fn starts_disabled() {
        let supervisor = supervisor(vec!["true".to_string()]).await;
        let status = supervisor.status();
        assert!(!status.enabled);
        assert!(status.socks_port.is_none());
        assert_eq!(supervisor.state().await, ProxyState::Stopped);
    }

    #[tokio::test]
    async fn disable_when_stopped_is_a_noop() {
        let supervisor = supervisor(vec!["true".to_string()]).await;
        let status = supervisor.disable().await.unwrap();
        assert!(!status.enabled);
        // No privacy audit should have been written for a no-op.
        let audit = supervisor.store.recent_audit(5).await.unwrap();
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn enable_fails_when_port_never_opens() {
        // `true` exits immediately and nothing listens on the port, so
        // the readiness budget expires.
        let supervisor = supervisor(vec!["true".to_string()]).await;
        let result = supervisor.clone().enable().await;
        assert!(matches!(result, Err(ProxyError::NotReady(_))));
        assert!(!supervisor.is_enabled());
        assert!(matches!(supervisor.state().await, ProxyState::Failed(_)));
    }

    #[tokio::test]
    async fn enable_fails_for_missing_binary() {
        let supervisor = supervisor(vec!["hublot-test-no-such-binary".to_string()]).await;
        let result = supervisor.clone().enable().await;
        assert!(matches!(result, Err(ProxyError::SpawnFailed(_))));
    }
}
