//! In-memory [`ContainerRuntime`] used by tests that must not depend on
//! a live Docker daemon.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::container_runtime::pty::PtyHandle;
use crate::container_runtime::types::{ContainerSpec, PtySize, StatsSample};
use crate::container_runtime::ContainerRuntime;
use crate::error_handling::types::ContainerError;

#[derive(Default)]
pub struct MockRuntime {
    /// container_ref -> running flag
    containers: Mutex<HashMap<String, bool>>,
    next_ref: AtomicU64,
    pub fail_create: AtomicBool,
    pub fail_stop: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running_count(&self) -> usize {
        self.containers
            .lock()
            .unwrap()
            .values()
            .filter(|running| **running)
            .count()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    /// Registers a container as if it had survived a process restart.
    pub fn seed_container(&self, container_ref: &str, running: bool) {
        self.containers
            .lock()
            .unwrap()
            .insert(container_ref.to_string(), running);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ensure_image(&self, _image: &str) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ContainerError::CreationFailed("mock failure".to_string()));
        }
        let container_ref = format!(
            "mock-{}-{}",
            spec.name,
            self.next_ref.fetch_add(1, Ordering::SeqCst)
        );
        self.containers
            .lock()
            .unwrap()
            .insert(container_ref.clone(), false);
        Ok(container_ref)
    }

    async fn start(&self, container_ref: &str) -> Result<(), ContainerError> {
        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(container_ref) {
            Some(running) => {
                *running = true;
                Ok(())
            }
            None => Err(ContainerError::NotFound(container_ref.to_string())),
        }
    }

    async fn exec_pty(
        &self,
        container_ref: &str,
        _argv: &[String],
        _env: &[String],
        _initial_size: PtySize,
    ) -> Result<PtyHandle, ContainerError> {
        if !self.is_running(container_ref).await? {
            return Err(ContainerError::ExecFailed(format!(
                "{} is not running",
                container_ref
            )));
        }
        let (_client, server) = tokio::io::duplex(1024);
        Ok(PtyHandle::new(
            Box::pin(stream::pending()),
            Box::pin(server),
            None,
        ))
    }

    async fn exec_capture(
        &self,
        container_ref: &str,
        _argv: &[String],
    ) -> Result<String, ContainerError> {
        if self.is_running(container_ref).await? {
            Ok("ok\r\n".to_string())
        } else {
            Err(ContainerError::ExecFailed(format!(
                "{} is not running",
                container_ref
            )))
        }
    }

    async fn signal(&self, container_ref: &str, _signal: &str) -> Result<(), ContainerError> {
        if self.containers.lock().unwrap().contains_key(container_ref) {
            Ok(())
        } else {
            Err(ContainerError::NotFound(container_ref.to_string()))
        }
    }

    async fn stop(&self, container_ref: &str, _grace_secs: i64) -> Result<(), ContainerError> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ContainerError::ApiError("mock stop failure".to_string()));
        }
        if let Some(running) = self.containers.lock().unwrap().get_mut(container_ref) {
            *running = false;
        }
        Ok(())
    }

    async fn remove(&self, container_ref: &str, _force: bool) -> Result<(), ContainerError> {
        self.containers.lock().unwrap().remove(container_ref);
        Ok(())
    }

    async fn is_running(&self, container_ref: &str) -> Result<bool, ContainerError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(container_ref)
            .copied()
            .unwrap_or(false))
    }

    async fn sample_stats(&self, _container_ref: &str) -> Result<StatsSample, ContainerError> {
        Ok(StatsSample {
            cpu_percent: Some(0.5),
            memory_usage_bytes: Some(1024 * 1024),
            memory_limit_bytes: Some(1024 * 1024 * 1024),
        })
    }
}
