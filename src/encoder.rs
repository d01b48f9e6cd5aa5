//! The encoder pipeline collaborator (spec §6.5): an external media
//! framework exposed through a templated-string contract. The core
//! substitutes `{width}`/`{bitrate}`/... placeholders into an app's
//! pipeline template and hands the rendered string to whichever
//! `EncoderPipeline` is configured — it never parses the template itself,
//! matching `original_source`'s `gst_parse_launch(fmt::format(...))`
//! approach without linking a GStreamer binding into the core crate.
//!
//! `EncoderSupervisor` is the piece of the session coordinator's §4.9
//! contract that actually starts pipelines: it subscribes to
//! `VideoSession`/`AudioSession` events, waits for the first RTP ping via
//! `SessionCoordinator::await_first_rtp_ping`/`await_first_rtp_audio_ping`,
//! and tears pipelines down on `PauseStream`/`StopStream`.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::{HostError, ResourceError, Result};
use crate::session::coordinator::SessionCoordinator;
use crate::session::{AudioSession, SessionEvent, VideoCodec, VideoSession};

/// Values substituted into an app's pipeline template. Field names match
/// the placeholder names verbatim (spec §6.5).
#[derive(Debug, Clone)]
pub struct TemplateParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u32,
    pub payload_size: u32,
    pub fec_percentage: u32,
    pub min_required_fec_packets: u32,
    pub slices_per_frame: u32,
    pub color_space: String,
    pub color_range: String,
    pub client_port: u16,
    pub client_ip: IpAddr,
    pub host_port: u16,
    pub aes_key: String,
    pub aes_iv: String,
    pub encrypt: bool,
}

/// Substitute every `{placeholder}` in `template` with its value. Unknown
/// placeholders are left untouched — the core does not validate the
/// template, it only substitutes (spec §6.5).
pub fn render_template(template: &str, params: &TemplateParams) -> String {
    template
        .replace("{width}", &params.width.to_string())
        .replace("{height}", &params.height.to_string())
        .replace("{fps}", &params.fps.to_string())
        .replace("{bitrate}", &params.bitrate.to_string())
        .replace("{payload_size}", &params.payload_size.to_string())
        .replace("{fec_percentage}", &params.fec_percentage.to_string())
        .replace("{min_required_fec_packets}", &params.min_required_fec_packets.to_string())
        .replace("{slices_per_frame}", &params.slices_per_frame.to_string())
        .replace("{color_space}", &params.color_space)
        .replace("{color_range}", &params.color_range)
        .replace("{client_port}", &params.client_port.to_string())
        .replace("{client_ip}", &params.client_ip.to_string())
        .replace("{host_port}", &params.host_port.to_string())
        .replace("{aes_key}", &params.aes_key)
        .replace("{aes_iv}", &params.aes_iv)
        .replace("{encrypt}", if params.encrypt { "true" } else { "false" })
}

fn color_space_name(value: u32) -> String {
    match value {
        1 => "bt709".to_string(),
        2 => "bt2020".to_string(),
        _ => "bt601".to_string(),
    }
}

/// The pluggable encoder framework contract. The core never owns an
/// encoding pipeline directly — it only starts and stops one by id.
#[async_trait]
pub trait EncoderPipeline: Send + Sync {
    async fn start(&self, session_id: u64, rendered_pipeline: String) -> Result<()>;
    async fn stop(&self, session_id: u64);
}

struct RunningPipeline {
    child: Mutex<Child>,
}

/// Reference `EncoderPipeline` that shells out to `gst-launch-1.0`,
/// mirroring `runner/process.rs`'s tokio::process supervision rather than
/// linking GStreamer's own Rust bindings into the core crate (the core
/// only renders and hands off a pipeline description, per spec §6.5).
pub struct GstLaunchPipeline {
    executable: String,
    processes: DashMap<u64, Arc<RunningPipeline>>,
}

impl GstLaunchPipeline {
    pub fn new() -> Self {
        Self {
            executable: "gst-launch-1.0".to_string(),
            processes: DashMap::new(),
        }
    }
}

impl Default for GstLaunchPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EncoderPipeline for GstLaunchPipeline {
    async fn start(&self, session_id: u64, rendered_pipeline: String) -> Result<()> {
        info!(session_id, "starting encoder pipeline");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("{} -e {}", self.executable, rendered_pipeline))
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(|e| {
            HostError::ResourceUnavailable(ResourceError::EncoderPipelineFailed {
                reason: format!("failed to spawn pipeline: {e}"),
            })
        })?;
        self.processes.insert(session_id, Arc::new(RunningPipeline { child: Mutex::new(child) }));
        Ok(())
    }

    async fn stop(&self, session_id: u64) {
        if let Some((_, running)) = self.processes.remove(&session_id) {
            debug!(session_id, "stopping encoder pipeline");
            let mut child = running.child.lock().await;
            if let Err(e) = child.kill().await {
                warn!(session_id, error = %e, "failed to kill encoder pipeline process");
            }
        }
    }
}

/// Drives the §4.9 "wait for first RTP ping, then start the pipeline"
/// contract for both the video and audio transports of every session.
pub struct EncoderSupervisor {
    config: Arc<HostConfig>,
    coordinator: Arc<SessionCoordinator>,
    video_pipeline: Arc<dyn EncoderPipeline>,
    audio_pipeline: Arc<dyn EncoderPipeline>,
}

impl EncoderSupervisor {
    pub fn new(
        config: Arc<HostConfig>,
        coordinator: Arc<SessionCoordinator>,
        video_pipeline: Arc<dyn EncoderPipeline>,
        audio_pipeline: Arc<dyn EncoderPipeline>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            coordinator,
            video_pipeline,
            audio_pipeline,
        })
    }

    /// Spawns the event-bus subscriber loop and returns immediately.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move { self.run().await });
    }

    async fn run(self: Arc<Self>) {
        let mut sub = self.coordinator.event_bus().subscribe();
        loop {
            match sub.recv().await {
                Some(SessionEvent::VideoSession(video)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.start_video(video).await });
                }
                Some(SessionEvent::AudioSession(audio)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.start_audio(audio).await });
                }
                Some(SessionEvent::PauseStream { session_id }) | Some(SessionEvent::StopStream { session_id }) => {
                    self.video_pipeline.stop(session_id).await;
                    self.audio_pipeline.stop(session_id).await;
                }
                Some(_) => continue,
                None => {
                    warn!("event bus closed, encoder supervisor exiting");
                    return;
                }
            }
        }
    }

    async fn start_video(self: Arc<Self>, video: VideoSession) {
        let Some(session) = self.coordinator.find_by_id(video.session_id) else {
            return;
        };
        let Some(app) = self.config.find_config_app(session.app_id) else {
            warn!(session_id = video.session_id, "video session for an app no longer in config");
            return;
        };
        let template = match video.codec {
            VideoCodec::H264 => app.h264_pipeline_template,
            VideoCodec::Hevc => app.hevc_pipeline_template,
            VideoCodec::Av1 => app.av1_pipeline_template,
        };
        if template.is_empty() {
            warn!(session_id = video.session_id, ?video.codec, "no pipeline template configured for codec");
            return;
        }

        let session_id = video.session_id;
        let port = session.video_stream_port;
        let bus = self.coordinator.event_bus();
        let ping_listener = spawn_ping_listener(port, session_id, bus, false);

        match self.coordinator.await_first_rtp_ping(session_id).await {
            Ok(()) => {
                let params = TemplateParams {
                    width: video.width,
                    height: video.height,
                    fps: video.fps,
                    bitrate: video.bitrate_kbps,
                    payload_size: video.packet_size,
                    fec_percentage: video.fec_percentage,
                    min_required_fec_packets: video.min_required_fec_packets,
                    slices_per_frame: video.slices_per_frame,
                    color_space: color_space_name(video.color_space),
                    color_range: if video.color_range_jpeg { "jpeg" } else { "mpeg2" }.to_string(),
                    client_port: port,
                    client_ip: session.client_ip,
                    host_port: port,
                    aes_key: hex::encode(session.aes_key),
                    aes_iv: hex::encode(session.aes_iv),
                    encrypt: true,
                };
                let rendered = render_template(&template, &params);
                if let Err(e) = self.video_pipeline.start(session_id, rendered).await {
                    warn!(session_id, error = %e, "failed to start video pipeline");
                }
            }
            Err(e) => debug!(session_id, error = %e, "video pipeline not started"),
        }
        ping_listener.abort();
    }

    async fn start_audio(self: Arc<Self>, audio: AudioSession) {
        let Some(session) = self.coordinator.find_by_id(audio.session_id) else {
            return;
        };
        let Some(app) = self.config.find_config_app(session.app_id) else {
            warn!(session_id = audio.session_id, "audio session for an app no longer in config");
            return;
        };
        if app.audio_pipeline_template.is_empty() {
            warn!(session_id = audio.session_id, "no audio pipeline template configured");
            return;
        }

        let session_id = audio.session_id;
        let port = session.audio_stream_port;
        let bus = self.coordinator.event_bus();
        let ping_listener = spawn_ping_listener(port, session_id, bus, true);

        match self.coordinator.await_first_rtp_audio_ping(session_id).await {
            Ok(()) => {
                let params = TemplateParams {
                    width: 0,
                    height: 0,
                    fps: 0,
                    bitrate: audio.bitrate_kbps,
                    payload_size: 0,
                    fec_percentage: 0,
                    min_required_fec_packets: 0,
                    slices_per_frame: 0,
                    color_space: String::new(),
                    color_range: String::new(),
                    client_port: port,
                    client_ip: session.client_ip,
                    host_port: port,
                    aes_key: hex::encode(session.aes_key),
                    aes_iv: hex::encode(session.aes_iv),
                    encrypt: true,
                };
                let rendered = render_template(&app.audio_pipeline_template, &params);
                if let Err(e) = self.audio_pipeline.start(session_id, rendered).await {
                    warn!(session_id, error = %e, "failed to start audio pipeline");
                }
            }
            Err(e) => debug!(session_id, error = %e, "audio pipeline not started"),
        }
        ping_listener.abort();
    }
}

/// Binds `port` and publishes the matching ping event on the first
/// datagram received — standing in for the external encoder pipeline's
/// own "open a UDP socket and await a PING" step (spec §2 flow) until a
/// real pipeline collaborator is plugged in.
fn spawn_ping_listener(
    port: u16,
    session_id: u64,
    bus: crate::session::SharedEventBus,
    audio: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(session_id, port, error = %e, "failed to bind RTP ping socket");
                return;
            }
        };
        let mut buf = [0u8; 64];
        if socket.recv_from(&mut buf).await.is_ok() {
            let event = if audio {
                SessionEvent::RtpAudioPing { session_id }
            } else {
                SessionEvent::RtpVideoPing { session_id }
            };
            bus.publish(event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TemplateParams {
        TemplateParams {
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate: 15000,
            payload_size: 1024,
            fec_percentage: 20,
            min_required_fec_packets: 0,
            slices_per_frame: 1,
            color_space: "bt709".to_string(),
            color_range: "jpeg".to_string(),
            client_port: 48100,
            client_ip: "192.168.1.50".parse().unwrap(),
            host_port: 48100,
            aes_key: "00".repeat(16),
            aes_iv: "11".repeat(16),
            encrypt: true,
        }
    }

    #[test]
    fn substitutes_every_known_placeholder() {
        let template = "videotestsrc ! x264enc bitrate={bitrate} ! udpsink host={client_ip} port={client_port}";
        let rendered = render_template(template, &params());
        assert_eq!(
            rendered,
            "videotestsrc ! x264enc bitrate=15000 ! udpsink host=192.168.1.50 port=48100"
        );
        assert!(!rendered.contains('{'));
    }

    #[test]
    fn leaves_unknown_placeholders_untouched() {
        let rendered = render_template("{unknown_field}", &params());
        assert_eq!(rendered, "{unknown_field}");
    }

    #[tokio::test]
    async fn pipeline_lifecycle_tracks_running_child() {
        let pipeline = GstLaunchPipeline::new();
        pipeline.start(1, "true".to_string()).await.unwrap();
        assert!(pipeline.processes.contains_key(&1));
        pipeline.stop(1).await;
        assert!(!pipeline.processes.contains_key(&1));
    }
}
