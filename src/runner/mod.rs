//! The Runner collaborator: launches an application as a process or
//! container with a composed environment. Out of scope per the core
//! protocol spec, but a usable in-tree implementation ships so the
//! binary runs standalone.

pub mod docker;
pub mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

/// Device-add events the coordinator posts while the runner is alive
/// (controller hot-plug).
#[derive(Debug, Clone)]
pub struct HotplugEvent {
    pub device_path: PathBuf,
}

#[async_trait]
pub trait Runner: Send + Sync {
    /// Blocks for the lifetime of the application.
    async fn run(
        &self,
        session_id: u64,
        app_state_folder: String,
        hotplug_queue: flume::Receiver<HotplugEvent>,
        input_device_paths: Vec<PathBuf>,
        mount_paths: Vec<PathBuf>,
        environment: BTreeMap<String, String>,
        render_node: String,
    ) -> Result<()>;

    async fn stop(&self, session_id: u64) -> Result<()>;
}

/// A runner that does nothing; useful for tests and for apps with no
/// process of their own (e.g. a bare virtual desktop).
pub struct NullRunner;

#[async_trait]
impl Runner for NullRunner {
    async fn run(
        &self,
        _session_id: u64,
        _app_state_folder: String,
        _hotplug_queue: flume::Receiver<HotplugEvent>,
        _input_device_paths: Vec<PathBuf>,
        _mount_paths: Vec<PathBuf>,
        _environment: BTreeMap<String, String>,
        _render_node: String,
    ) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _session_id: u64) -> Result<()> {
        Ok(())
    }
}
