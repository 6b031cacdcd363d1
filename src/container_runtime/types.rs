//! Core types used by the container runtime subsystem.

use serde::{Deserialize, Serialize};

/// Hard resource limits applied to a session container. Immutable after
/// creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes (also used as the swap ceiling).
    pub memory_bytes: i64,
    /// Relative CPU weight (Docker `cpu_shares`).
    pub cpu_shares: i64,
    /// Maximum number of processes inside the container.
    pub pids_max: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 1024 * 1024 * 1024,
            cpu_shares: 1024,
            pids_max: 200,
        }
    }
}

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Everything the runtime needs to create a session container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Name the container is registered under with the engine.
    pub name: String,
    /// Image reference, already validated against the allow-list.
    pub image: String,
    pub limits: ResourceLimits,
    /// Environment for the container's init process.
    pub env: Vec<String>,
    /// Init command; must keep PID 1 alive for the session's lifetime.
    pub cmd: Vec<String>,
}

/// One-shot resource usage sample for a running container.
#[derive(Debug, Clone, Default)]
pub struct StatsSample {
    pub cpu_percent: Option<f64>,
    pub memory_usage_bytes: Option<i64>,
    pub memory_limit_bytes: Option<i64>,
}
