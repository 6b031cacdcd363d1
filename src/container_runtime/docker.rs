//! Docker implementation of the [`ContainerRuntime`] capability trait.
//!
//! Talks to the local Docker Engine over its socket via bollard. Session
//! containers run with all capabilities dropped except a minimal set,
//! `no-new-privileges`, bridge networking, and the session's resource
//! limits.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use log::{debug, info, warn};

use crate::container_runtime::pty::PtyHandle;
use crate::container_runtime::types::{ContainerSpec, PtySize, StatsSample};
use crate::container_runtime::ContainerRuntime;
use crate::error_handling::types::ContainerError;

/// Capabilities kept after dropping everything else; the minimum for
/// package managers and shells to behave inside the sandbox.
const KEPT_CAPABILITIES: [&str; 5] = ["CHOWN", "DAC_OVERRIDE", "FOWNER", "SETUID", "SETGID"];

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon and verifies it responds.
    pub async fn connect() -> Result<Self, ContainerError> {
        if let Ok(host) = std::env::var("DOCKER_HOST") {
            info!("Connecting to Docker at DOCKER_HOST={}", host);
        }

        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::RuntimeUnavailable(e.to_string()))?;

        docker
            .ping()
            .await
            .map_err(|e| ContainerError::RuntimeUnavailable(e.to_string()))?;

        let version = docker.version().await?;
        info!(
            "Docker connected (engine {})",
            version.version.unwrap_or_else(|| "unknown".to_string())
        );

        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        let images = self.docker.list_images::<String>(None).await?;
        let present = images
            .iter()
            .any(|img| img.repo_tags.iter().any(|tag| tag == image));
        if present {
            debug!("Image {} already present", image);
            return Ok(());
        }

        info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull progress for {}: {}", image, status);
                    }
                }
                Err(e) => {
                    return Err(ContainerError::ImageUnavailable(format!(
                        "{}: {}",
                        image, e
                    )));
                }
            }
        }

        info!("Pulled image {}", image);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            working_dir: Some("/root".to_string()),
            host_config: Some(HostConfig {
                memory: Some(spec.limits.memory_bytes),
                memory_swap: Some(spec.limits.memory_bytes),
                cpu_shares: Some(spec.limits.cpu_shares),
                pids_limit: Some(spec.limits.pids_max),
                privileged: Some(false),
                readonly_rootfs: Some(false),
                network_mode: Some("bridge".to_string()),
                // Lets containers reach the host-side SOCKS proxy when
                // anonymity is enabled.
                extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
                cap_drop: Some(vec!["ALL".to_string()]),
                cap_add: Some(KEPT_CAPABILITIES.iter().map(|c| c.to_string()).collect()),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 507,
                    message,
                } => ContainerError::ResourceExhausted(message),
                other => ContainerError::CreationFailed(other.to_string()),
            })?;

        debug!("Created container {} as {}", spec.name, response.id);
        Ok(response.id)
    }

    async fn start(&self, container_ref: &str) -> Result<(), ContainerError> {
        self.docker
            .start_container(container_ref, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ContainerError::StartFailed(e.to_string()))?;
        debug!("Started container {}", container_ref);
        Ok(())
    }

    async fn exec_pty(
        &self,
        container_ref: &str,
        argv: &[String],
        env: &[String],
        initial_size: PtySize,
    ) -> Result<PtyHandle, ContainerError> {
        let exec = self
            .docker
            .create_exec(
                container_ref,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    env: Some(env.to_vec()),
                    working_dir: Some("/root".to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ContainerError::ExecFailed(e.to_string()))?;

        let exec_id = exec.id;
        let started = self
            .docker
            .start_exec(
                &exec_id,
                Some(StartExecOptions {
                    tty: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| ContainerError::ExecFailed(e.to_string()))?;

        let (output, input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(ContainerError::ExecFailed(
                    "exec started detached".to_string(),
                ));
            }
        };

        // The exec must be running before its TTY accepts a resize.
        let size_result = self
            .docker
            .resize_exec(
                &exec_id,
                bollard::exec::ResizeExecOptions {
                    height: initial_size.rows,
                    width: initial_size.cols,
                },
            )
            .await;
        if let Err(e) = size_result {
            debug!("Initial PTY resize failed (non-fatal): {}", e);
        }

        let exec_label = exec_id.clone();
        let bytes = output.filter_map(move |item| {
            let exec_label = exec_label.clone();
            async move {
                match item {
                    Ok(LogOutput::StdIn { .. }) => None,
                    Ok(out) => Some(out.into_bytes().to_vec()),
                    Err(e) => {
                        warn!("PTY output error on exec {}: {}", exec_label, e);
                        None
                    }
                }
            }
        });

        debug!("Attached PTY exec {} on {}", exec_id, container_ref);
        Ok(PtyHandle::new(
            Box::pin(bytes),
            input,
            Some((self.docker.clone(), exec_id)),
        ))
    }

    async fn exec_capture(
        &self,
        container_ref: &str,
        argv: &[String],
    ) -> Result<String, ContainerError> {
        let exec = self
            .docker
            .create_exec(
                container_ref,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdin: Some(false),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ContainerError::ExecFailed(e.to_string()))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ContainerError::ExecFailed(e.to_string()))?;

        match started {
            StartExecResults::Attached { mut output, .. } => {
                let mut collected = String::new();
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(out) => {
                            collected.push_str(&String::from_utf8_lossy(&out.into_bytes()));
                        }
                        Err(e) => {
                            return Err(ContainerError::ExecFailed(e.to_string()));
                        }
                    }
                }
                Ok(collected)
            }
            StartExecResults::Detached => Ok(String::new()),
        }
    }

    async fn signal(&self, container_ref: &str, signal: &str) -> Result<(), ContainerError> {
        self.docker
            .kill_container(container_ref, Some(KillContainerOptions { signal }))
            .await?;
        Ok(())
    }

    async fn stop(&self, container_ref: &str, grace_secs: i64) -> Result<(), ContainerError> {
        let result = self
            .docker
            .stop_container(container_ref, Some(StopContainerOptions { t: grace_secs }))
            .await;

        match result {
            Ok(()) => {
                debug!("Container {} stopped", container_ref);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already gone", container_ref);
                Ok(())
            }
            Err(e) => {
                warn!("Graceful stop failed for {}, killing: {}", container_ref, e);
                self.docker
                    .kill_container::<String>(container_ref, None)
                    .await?;
                Ok(())
            }
        }
    }

    async fn remove(&self, container_ref: &str, force: bool) -> Result<(), ContainerError> {
        let result = self
            .docker
            .remove_container(
                container_ref,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await;

        match result {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} removed", container_ref);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn is_running(&self, container_ref: &str) -> Result<bool, ContainerError> {
        match self
            .docker
            .inspect_container(container_ref, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(details
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn sample_stats(&self, container_ref: &str) -> Result<StatsSample, ContainerError> {
        let mut stream = self.docker.stats(
            container_ref,
            Some(StatsOptions {
                stream: false,
                ..Default::default()
            }),
        );

        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(ContainerError::ApiError(
                    "no stats available".to_string(),
                ));
            }
        };

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage) as f64;
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0))
            as f64;

        let cpu_percent = if system_delta > 0.0 {
            let cores = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
            Some((cpu_delta / system_delta) * cores * 100.0)
        } else {
            Some(0.0)
        };

        Ok(StatsSample {
            cpu_percent,
            memory_usage_bytes: stats.memory_stats.usage.map(|u| u as i64),
            memory_limit_bytes: stats.memory_stats.limit.map(|l| l as i64),
        })
    }
}
