//! Bare-process Runner: spawns the configured executable with the
//! coordinator's composed environment and watches it for the session's
//! lifetime.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{HostError, ResourceError, Result};
use crate::runner::{HotplugEvent, Runner};

#[derive(Debug, Clone)]
pub struct ProcessRunnerConfig {
    pub executable_path: String,
    pub args: Vec<String>,
}

struct RunningProcess {
    child: Mutex<Child>,
    monitor: tokio::task::JoinHandle<()>,
}

/// One `ProcessRunner` instance is shared across sessions; it tracks each
/// session's child process by id so `stop` can target the right one.
pub struct ProcessRunner {
    config: ProcessRunnerConfig,
    processes: DashMap<u64, Arc<RunningProcess>>,
}

impl ProcessRunner {
    pub fn new(config: ProcessRunnerConfig) -> Result<Self> {
        if !std::path::Path::new(&config.executable_path).exists() {
            return Err(HostError::ResourceUnavailable(
                ResourceError::RunnerStartFailed {
                    reason: format!("executable not found: {}", config.executable_path),
                },
            ));
        }
        Ok(Self {
            config,
            processes: DashMap::new(),
        })
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(
        &self,
        session_id: u64,
        app_state_folder: String,
        hotplug_queue: flume::Receiver<HotplugEvent>,
        _input_device_paths: Vec<PathBuf>,
        _mount_paths: Vec<PathBuf>,
        environment: BTreeMap<String, String>,
        render_node: String,
    ) -> Result<()> {
        info!(session_id, executable = %self.config.executable_path, "launching application process");

        let mut cmd = Command::new(&self.config.executable_path);
        cmd.args(&self.config.args)
            .env("XDG_STATE_HOME", &app_state_folder)
            .env("RENDER_NODE", &render_node)
            .kill_on_drop(true);
        for (k, v) in &environment {
            cmd.env(k, v);
        }

        let child = cmd.spawn().map_err(|e| {
            HostError::ResourceUnavailable(ResourceError::RunnerStartFailed {
                reason: format!("failed to spawn process: {e}"),
            })
        })?;
        let pid = child.id().unwrap_or(0);
        info!(session_id, pid, "application process started");

        let monitor = tokio::spawn(async move {
            loop {
                tokio::select! {
                    hotplug = hotplug_queue.recv_async() => {
                        match hotplug {
                            Ok(event) => debug!(?event.device_path, "hot-plug device forwarded to process environment"),
                            Err(_) => break,
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        debug!(session_id, "process health check tick");
                    }
                }
            }
        });

        let running = Arc::new(RunningProcess {
            child: Mutex::new(child),
            monitor,
        });
        self.processes.insert(session_id, running.clone());

        let status = running.child.lock().await.wait().await;
        match status {
            Ok(status) => info!(session_id, ?status, "application process exited"),
            Err(e) => warn!(session_id, error = %e, "error waiting on application process"),
        }
        self.processes.remove(&session_id);
        Ok(())
    }

    async fn stop(&self, session_id: u64) -> Result<()> {
        if let Some((_, running)) = self.processes.remove(&session_id) {
            running.monitor.abort();
            let mut child = running.child.lock().await;
            if let Err(e) = child.kill().await {
                warn!(session_id, error = %e, "failed to kill application process");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProcessRunnerConfig {
        ProcessRunnerConfig {
            executable_path: "/bin/sleep".to_string(),
            args: vec!["30".to_string()],
        }
    }

    #[test]
    fn rejects_missing_executable() {
        let config = ProcessRunnerConfig {
            executable_path: "/nonexistent/path".to_string(),
            args: vec![],
        };
        assert!(ProcessRunner::new(config).is_err());
    }

    #[tokio::test]
    async fn runs_and_stops_process() {
        let runner = ProcessRunner::new(test_config()).unwrap();
        let (_tx, rx) = flume::unbounded();
        let runner = Arc::new(runner);
        let runner_clone = runner.clone();
        let handle = tokio::spawn(async move {
            runner_clone
                .run(1, "/tmp".into(), rx, vec![], vec![], BTreeMap::new(), String::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.stop(1).await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
