//! Container runtime subsystem.
//!
//! Abstracts the container engine behind the [`ContainerRuntime`]
//! capability trait so the session layer never talks to Docker directly.
//!
//! Components:
//! - `docker`: bollard-backed [`DockerRuntime`] implementation.
//! - `pty`: the [`PtyHandle`] returned by `exec_pty`.
//! - `types`: specs, limits, and stat samples.

pub mod docker;
pub mod pty;
#[cfg(test)]
pub mod testing;
pub mod types;

use async_trait::async_trait;

use crate::error_handling::types::ContainerError;
pub use docker::DockerRuntime;
pub use pty::{PtyHandle, PtyInput, PtyOutput};
pub use types::{ContainerSpec, PtySize, ResourceLimits, StatsSample};

/// Capability interface over a container engine.
///
/// All methods are suspension points; implementations must be safe to
/// call concurrently from independent sessions.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Makes `image` available locally, pulling it when absent.
    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError>;

    /// Creates a container and returns the engine-assigned reference.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    async fn start(&self, container_ref: &str) -> Result<(), ContainerError>;

    /// Attaches an interactive TTY exec running `argv` and returns its
    /// PTY handle. Reads return as soon as bytes are available.
    async fn exec_pty(
        &self,
        container_ref: &str,
        argv: &[String],
        env: &[String],
        initial_size: PtySize,
    ) -> Result<PtyHandle, ContainerError>;

    /// Runs `argv` to completion and returns its combined output. Used
    /// for readiness probes.
    async fn exec_capture(
        &self,
        container_ref: &str,
        argv: &[String],
    ) -> Result<String, ContainerError>;

    /// Delivers `signal` (e.g. `"SIGTERM"`) to the container's init.
    async fn signal(&self, container_ref: &str, signal: &str) -> Result<(), ContainerError>;

    /// SIGTERM, then SIGKILL once `grace_secs` elapse. Tolerates a
    /// container that is already gone.
    async fn stop(&self, container_ref: &str, grace_secs: i64) -> Result<(), ContainerError>;

    /// Removes the container. Tolerates a container that is already gone.
    async fn remove(&self, container_ref: &str, force: bool) -> Result<(), ContainerError>;

    /// Whether the container currently has a running init process.
    async fn is_running(&self, container_ref: &str) -> Result<bool, ContainerError>;

    /// One-shot resource usage sample.
    async fn sample_stats(&self, container_ref: &str) -> Result<StatsSample, ContainerError>;
}
