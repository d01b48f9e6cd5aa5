//! Exercises the wiring between the session coordinator, the event bus,
//! and the encoder supervisor that the per-module unit tests don't cover
//! in combination: an RTSP-announce-shaped `VideoSession`/`AudioSession`
//! event reaching a pipeline start only after the first RTP ping arrives.

use std::collections::BTreeMap;
use std::net::UdpSocket as StdUdpSocket;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use moonlight_host::config::HostConfig;
use moonlight_host::encoder::{EncoderPipeline, EncoderSupervisor};
use moonlight_host::error::Result;
use moonlight_host::runner::NullRunner;
use moonlight_host::session::coordinator::SessionCoordinator;
use moonlight_host::session::{EventBus, SessionEvent, StreamSession, VideoCodec, VideoSession};

#[derive(Default)]
struct RecordingPipeline {
    started: Mutex<Vec<(u64, String)>>,
    stopped: Mutex<Vec<u64>>,
}

#[async_trait]
impl EncoderPipeline for RecordingPipeline {
    async fn start(&self, session_id: u64, rendered_pipeline: String) -> Result<()> {
        self.started.lock().unwrap().push((session_id, rendered_pipeline));
        Ok(())
    }

    async fn stop(&self, session_id: u64) {
        self.stopped.lock().unwrap().push(session_id);
    }
}

const APP_ID: u32 = 1;

/// Writes a config file with one app carrying a pipeline template, then
/// loads it — `HostConfig::load_or_default` only seeds an empty app list
/// on a *missing* file, so a populated one must already exist on disk.
fn config_with_templated_app() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("moonlight-host-encoder-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.toml");
    std::fs::write(
        &path,
        r#"
uuid = "11111111-1111-1111-1111-111111111111"
hostname = "test-host"
config_version = 2
support_hevc = false
support_av1 = false

[[apps]]
title = "Test App"
id = 1
h264_pipeline_template = "videotestsrc ! x264enc bitrate={bitrate} ! udpsink host={client_ip} port={client_port}"
audio_pipeline_template = "audiotestsrc ! opusenc ! udpsink host={client_ip} port={client_port}"
"#,
    )
    .unwrap();
    path
}

#[tokio::test]
async fn video_pipeline_starts_only_after_first_rtp_ping() {
    let config = HostConfig::load_or_default(config_with_templated_app()).unwrap();
    let app = config.find_config_app(APP_ID).unwrap();
    assert!(!app.h264_pipeline_template.is_empty(), "test app must carry a pipeline template");

    let bus = Arc::new(EventBus::new());
    let coordinator = SessionCoordinator::new(bus.clone(), Arc::new(NullRunner));
    let (video_port, audio_port) = coordinator.reserve_ports().await.unwrap();

    let session = StreamSession {
        session_id: StreamSession::next_id(),
        display_width: 1920,
        display_height: 1080,
        display_fps: 60,
        support_hevc: false,
        support_av1: false,
        audio_channel_count: 2,
        aes_key: [7u8; 16],
        aes_iv: [9u8; 16],
        client_ip: "127.0.0.1".parse().unwrap(),
        app_id: APP_ID,
        video_stream_port: video_port,
        audio_stream_port: audio_port,
        input_devices: parking_lot::Mutex::new(Default::default()),
        virtual_display: None,
        last_control_seq: std::sync::atomic::AtomicU32::new(0),
    };
    let session_id = session.session_id;
    coordinator
        .start_session(session, BTreeMap::new(), "/tmp".into(), app.render_node.clone(), Arc::new(NullRunner))
        .await
        .unwrap();

    let video_pipeline = Arc::new(RecordingPipeline::default());
    let audio_pipeline = Arc::new(RecordingPipeline::default());
    EncoderSupervisor::new(config, coordinator, video_pipeline.clone(), audio_pipeline).spawn();

    bus.publish(SessionEvent::VideoSession(VideoSession {
        session_id,
        width: 1920,
        height: 1080,
        fps: 60,
        codec: VideoCodec::H264,
        bitrate_kbps: 15000,
        packet_size: 1024,
        fec_percentage: 20,
        min_required_fec_packets: 0,
        slices_per_frame: 1,
        color_range_jpeg: true,
        color_space: 1,
    }));

    // The pipeline must not start before a ping arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(video_pipeline.started.lock().unwrap().is_empty());

    let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"ping", ("127.0.0.1", video_port)).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let started = video_pipeline.started.lock().unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].0, session_id);
    assert!(started[0].1.contains("15000"), "bitrate placeholder should be substituted");
    assert!(!started[0].1.contains('{'), "no placeholder should remain unrendered");
}

#[tokio::test]
async fn stop_stream_event_tears_down_both_pipelines() {
    let config = HostConfig::load_or_default(config_with_templated_app()).unwrap();
    let bus = Arc::new(EventBus::new());
    let coordinator = SessionCoordinator::new(bus.clone(), Arc::new(NullRunner));

    let video_pipeline = Arc::new(RecordingPipeline::default());
    let audio_pipeline = Arc::new(RecordingPipeline::default());
    EncoderSupervisor::new(config, coordinator, video_pipeline.clone(), audio_pipeline.clone()).spawn();

    bus.publish(SessionEvent::StopStream { session_id: 99 });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(video_pipeline.stopped.lock().unwrap().as_slice(), &[99]);
    assert_eq!(audio_pipeline.stopped.lock().unwrap().as_slice(), &[99]);
}
