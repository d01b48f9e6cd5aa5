//! Container Runner: shells out to the `docker` CLI rather than linking a
//! Docker client library, keeping the dependency footprint aligned with
//! the rest of the crate. Best-effort: if the `docker` binary is absent
//! this degrades to `ResourceUnavailable` rather than panicking.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{HostError, ResourceError, Result};
use crate::runner::{HotplugEvent, Runner};

#[derive(Debug, Clone)]
pub struct DockerRunnerConfig {
    pub image: String,
    pub extra_args: Vec<String>,
}

pub struct DockerRunner {
    config: DockerRunnerConfig,
}

impl DockerRunner {
    pub fn new(config: DockerRunnerConfig) -> Self {
        Self { config }
    }

    fn container_name(session_id: u64) -> String {
        format!("moonlight-host-session-{session_id}")
    }
}

#[async_trait]
impl Runner for DockerRunner {
    async fn run(
        &self,
        session_id: u64,
        app_state_folder: String,
        hotplug_queue: flume::Receiver<HotplugEvent>,
        _input_device_paths: Vec<PathBuf>,
        mount_paths: Vec<PathBuf>,
        environment: BTreeMap<String, String>,
        render_node: String,
    ) -> Result<()> {
        let name = Self::container_name(session_id);
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(&name)
            .arg("--device")
            .arg(&render_node)
            .arg("-v")
            .arg(format!("{app_state_folder}:/state"));
        for mount in &mount_paths {
            cmd.arg("-v").arg(format!("{}:{}", mount.display(), mount.display()));
        }
        for (k, v) in &environment {
            cmd.arg("-e").arg(format!("{k}={v}"));
        }
        cmd.arg(&self.config.image).args(&self.config.extra_args);

        info!(session_id, image = %self.config.image, "launching application container");

        let mut child = cmd.spawn().map_err(|e| {
            HostError::ResourceUnavailable(ResourceError::RunnerStartFailed {
                reason: format!("docker CLI unavailable: {e}"),
            })
        })?;

        // Hot-plug device-add events are forwarded into the container via
        // `docker exec` of a udev-trigger helper; dropped if docker is
        // unavailable for the forwarding step (best-effort).
        tokio::spawn(async move {
            while let Ok(event) = hotplug_queue.recv_async().await {
                let status = Command::new("docker")
                    .args(["exec", &Self::container_name(session_id), "udevadm", "trigger"])
                    .arg(event.device_path.to_string_lossy().to_string())
                    .status()
                    .await;
                if let Err(e) = status {
                    warn!(session_id, error = %e, "failed to forward hot-plug event into container");
                }
            }
        });

        let status = child.wait().await;
        match status {
            Ok(status) => info!(session_id, ?status, "container exited"),
            Err(e) => warn!(session_id, error = %e, "error waiting on container"),
        }
        Ok(())
    }

    async fn stop(&self, session_id: u64) -> Result<()> {
        let status = Command::new("docker")
            .args(["stop", &Self::container_name(session_id)])
            .status()
            .await;
        if let Err(e) = status {
            warn!(session_id, error = %e, "failed to stop container");
        }
        Ok(())
    }
}
