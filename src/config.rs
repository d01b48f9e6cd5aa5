//! Persisted TOML configuration: host identity, paired clients, launchable
//! apps, and default encoder settings. Reads go through an `ArcSwap`
//! snapshot; writes rewrite the whole file atomically (temp file + rename)
//! and then swap the in-memory snapshot, mirroring the session
//! coordinator's read-snapshot/write-then-swap discipline.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::HostError;
use crate::session::PairedClient as RuntimePairedClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigApp {
    pub title: String,
    pub id: u32,
    #[serde(default)]
    pub support_hdr: bool,
    #[serde(default = "default_render_node")]
    pub render_node: String,
    #[serde(default = "default_true")]
    pub start_virtual_compositor: bool,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub h264_pipeline_template: String,
    #[serde(default)]
    pub hevc_pipeline_template: String,
    #[serde(default)]
    pub av1_pipeline_template: String,
    #[serde(default)]
    pub audio_pipeline_template: String,
    #[serde(default = "default_joypad_type_hint")]
    pub joypad_type_hint: String,
}

fn default_joypad_type_hint() -> String {
    "xbox".into()
}

impl From<&ConfigApp> for crate::session::App {
    fn from(a: &ConfigApp) -> Self {
        Self {
            title: a.title.clone(),
            id: a.id,
            support_hdr: a.support_hdr,
            h264_pipeline_template: a.h264_pipeline_template.clone(),
            hevc_pipeline_template: a.hevc_pipeline_template.clone(),
            av1_pipeline_template: a.av1_pipeline_template.clone(),
            audio_pipeline_template: a.audio_pipeline_template.clone(),
            render_node: a.render_node.clone(),
            start_virtual_compositor: a.start_virtual_compositor,
            joypad_type_hint: a.joypad_type_hint.clone(),
            runner_kind: match &a.runner {
                RunnerConfig::Process { .. } => "process".to_string(),
                RunnerConfig::Docker { .. } => "docker".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunnerConfig {
    Process { run_cmd: String },
    Docker { image: String },
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig::Process {
            run_cmd: "sh -c \"while :; do sleep 1; done\"".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlPairedClient {
    pub client_cert: String,
    pub app_state_folder: String,
    #[serde(default = "default_uid")]
    pub run_uid: u32,
    #[serde(default = "default_uid")]
    pub run_gid: u32,
}

impl From<&RuntimePairedClient> for TomlPairedClient {
    fn from(c: &RuntimePairedClient) -> Self {
        Self {
            client_cert: c.client_cert_pem.clone(),
            app_state_folder: c.app_state_folder.clone(),
            run_uid: c.run_uid,
            run_gid: c.run_gid,
        }
    }
}

impl From<&TomlPairedClient> for RuntimePairedClient {
    fn from(c: &TomlPairedClient) -> Self {
        Self {
            client_cert_pem: c.client_cert.clone(),
            app_state_folder: c.app_state_folder.clone(),
            run_uid: c.run_uid,
            run_gid: c.run_gid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GstreamerVideoDefaults {
    #[serde(default)]
    pub default_source: String,
    #[serde(default)]
    pub default_sink: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GstreamerAudioDefaults {
    #[serde(default)]
    pub default_source: String,
    #[serde(default)]
    pub default_sink: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GstreamerDefaults {
    #[serde(default)]
    pub video: GstreamerVideoDefaults,
    #[serde(default)]
    pub audio: GstreamerAudioDefaults,
}

fn default_true() -> bool {
    true
}
fn default_uid() -> u32 {
    1000
}
fn default_render_node() -> String {
    "/dev/dri/renderD128".into()
}
fn current_config_version() -> u32 {
    2
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
}

fn default_display_modes() -> Vec<DisplayMode> {
    vec![
        DisplayMode { width: 1920, height: 1080, refresh_rate: 60 },
        DisplayMode { width: 1024, height: 768, refresh_rate: 30 },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfigFile {
    pub uuid: String,
    pub hostname: String,
    #[serde(default = "current_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub support_hevc: bool,
    #[serde(default)]
    pub support_av1: bool,
    #[serde(default = "default_display_modes")]
    pub display_modes: Vec<DisplayMode>,
    #[serde(default)]
    pub paired_clients: Vec<TomlPairedClient>,
    #[serde(default)]
    pub apps: Vec<ConfigApp>,
    #[serde(default)]
    pub gstreamer: GstreamerDefaults,
}

impl HostConfigFile {
    fn default_for_new_host() -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "moonlight-host".into()),
            config_version: current_config_version(),
            support_hevc: false,
            support_av1: false,
            display_modes: default_display_modes(),
            paired_clients: Vec::new(),
            apps: Vec::new(),
            gstreamer: GstreamerDefaults::default(),
        }
    }
}

/// Shared handle: current snapshot plus the file path to rewrite on
/// mutation.
pub struct HostConfig {
    path: PathBuf,
    snapshot: ArcSwap<HostConfigFile>,
}

impl HostConfig {
    /// Load `path`, creating a fresh default config (with a freshly
    /// generated UUID) if it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Arc<Self>, HostError> {
        let path = path.as_ref().to_path_buf();
        let file = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(HostError::Io)?;
            toml::from_str(&text)
                .map_err(|e| HostError::Config(format!("malformed config at {}: {e}", path.display())))?
        } else {
            warn!(path = %path.display(), "no config file found, creating default");
            let file = HostConfigFile::default_for_new_host();
            write_atomic(&path, &file)?;
            file
        };

        Ok(Arc::new(Self {
            path,
            snapshot: ArcSwap::from_pointee(file),
        }))
    }

    pub fn snapshot(&self) -> Arc<HostConfigFile> {
        self.snapshot.load_full()
    }

    pub fn paired_clients(&self) -> Vec<RuntimePairedClient> {
        self.snapshot().paired_clients.iter().map(Into::into).collect()
    }

    pub fn apps(&self) -> Vec<crate::session::App> {
        self.snapshot().apps.iter().map(Into::into).collect()
    }

    pub fn find_app(&self, id: u32) -> Option<crate::session::App> {
        self.snapshot().apps.iter().find(|a| a.id == id).map(Into::into)
    }

    /// The raw config entry for `id`, carrying the full `RunnerConfig`
    /// (`find_app`'s `session::App` only keeps a `"process"|"docker"` tag,
    /// enough for `/applist` but not enough to actually launch one).
    pub fn find_config_app(&self, id: u32) -> Option<ConfigApp> {
        self.snapshot().apps.iter().find(|a| a.id == id).cloned()
    }

    /// Append `client` and rewrite the file atomically. Idempotent:
    /// re-pairing an already-present certificate is a no-op (§8 invariant 7).
    pub fn pair(&self, client: &RuntimePairedClient) -> Result<(), HostError> {
        let current = self.snapshot();
        if current.paired_clients.iter().any(|c| c.client_cert == client.client_cert_pem) {
            return Ok(());
        }
        let mut updated = (*current).clone();
        updated.paired_clients.push(client.into());
        write_atomic(&self.path, &updated)?;
        self.snapshot.store(Arc::new(updated));
        info!(path = %self.path.display(), "persisted new paired client");
        Ok(())
    }

    /// Remove any paired client matching `client_cert_pem`. Idempotent.
    pub fn unpair(&self, client_cert_pem: &str) -> Result<(), HostError> {
        let current = self.snapshot();
        let mut updated = (*current).clone();
        updated.paired_clients.retain(|c| c.client_cert != client_cert_pem);
        if updated.paired_clients.len() == current.paired_clients.len() {
            return Ok(());
        }
        write_atomic(&self.path, &updated)?;
        self.snapshot.store(Arc::new(updated));
        Ok(())
    }
}

fn write_atomic(path: &Path, file: &HostConfigFile) -> Result<(), HostError> {
    let text = toml::to_string_pretty(file).map_err(|e| HostError::Config(e.to_string()))?;
    let tmp_path = path.with_extension("toml.tmp");
    {
        let mut tmp = std::fs::File::create(&tmp_path).map_err(HostError::Io)?;
        tmp.write_all(text.as_bytes()).map_err(HostError::Io)?;
        tmp.sync_all().map_err(HostError::Io)?;
    }
    std::fs::rename(&tmp_path, path).map_err(HostError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_default_when_missing_then_reloads_unchanged() {
        let dir = tempdir();
        let path = dir.join("config.toml");
        let cfg = HostConfig::load_or_default(&path).unwrap();
        let uuid = cfg.snapshot().uuid.clone();

        let reloaded = HostConfig::load_or_default(&path).unwrap();
        assert_eq!(reloaded.snapshot().uuid, uuid);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn pair_is_idempotent() {
        let dir = tempdir();
        let path = dir.join("config.toml");
        let cfg = HostConfig::load_or_default(&path).unwrap();
        let client = RuntimePairedClient {
            client_cert_pem: "cert-a".into(),
            app_state_folder: "/tmp/a".into(),
            run_uid: 1000,
            run_gid: 1000,
        };
        cfg.pair(&client).unwrap();
        cfg.pair(&client).unwrap();
        assert_eq!(cfg.snapshot().paired_clients.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unpair_is_idempotent() {
        let dir = tempdir();
        let path = dir.join("config.toml");
        let cfg = HostConfig::load_or_default(&path).unwrap();
        let client = RuntimePairedClient {
            client_cert_pem: "cert-b".into(),
            app_state_folder: "/tmp/b".into(),
            run_uid: 1000,
            run_gid: 1000,
        };
        cfg.pair(&client).unwrap();
        cfg.unpair("cert-b").unwrap();
        cfg.unpair("cert-b").unwrap();
        assert!(cfg.snapshot().paired_clients.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("moonlight-host-config-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
