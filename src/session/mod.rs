//! Data model: paired clients, applications, stream sessions, and the
//! event bus that ties RTSP/control/coordinator components together.

pub mod coordinator;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A stable record persisted across restarts. Identity is `hash(client_cert)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairedClient {
    pub client_cert_pem: String,
    pub app_state_folder: String,
    pub run_uid: u32,
    pub run_gid: u32,
}

impl PairedClient {
    /// Hashes the certificate's DER bytes, not the PEM text, so this
    /// matches `PairingService::find_paired`'s lookup key (which hashes
    /// the raw DER a client presents at the TLS layer). Falls back to
    /// hashing the PEM text verbatim if it somehow fails to parse — this
    /// should never happen for a `client_cert_pem` we generated ourselves.
    pub fn identity(&self) -> [u8; 32] {
        match crate::crypto::x509::load_pem(&self.client_cert_pem) {
            Ok(der) => crate::crypto::sha256(&der),
            Err(_) => crate::crypto::sha256(self.client_cert_pem.as_bytes()),
        }
    }
}

/// Transient per-phase pairing state keyed by `client_unique_id@client_ip`.
#[derive(Debug, Clone)]
pub struct PairingAttempt {
    pub client_cert_der: Vec<u8>,
    pub aes_key: [u8; 16],
    pub server_secret: Option<[u8; 16]>,
    pub server_challenge: Option<[u8; 16]>,
    pub client_hash: Option<[u8; 32]>,
    pub phase: u8,
}

pub fn pairing_cache_key(unique_id: &str, client_ip: &IpAddr) -> String {
    format!("{unique_id}@{client_ip}")
}

/// Declarative launch target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub title: String,
    pub id: u32,
    pub support_hdr: bool,
    pub h264_pipeline_template: String,
    pub hevc_pipeline_template: String,
    pub av1_pipeline_template: String,
    pub audio_pipeline_template: String,
    pub render_node: String,
    pub start_virtual_compositor: bool,
    pub joypad_type_hint: String,
    pub runner_kind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Hevc,
    Av1,
}

/// Virtual input device handles owned by a `StreamSession`.
#[derive(Debug, Default)]
pub struct InputDeviceHandles {
    pub mouse: Option<u64>,
    pub keyboard: Option<u64>,
    pub joypads: BTreeMap<u8, u64>,
    pub pen: Option<u64>,
    pub touch: Option<u64>,
}

/// The central binding object: a paired client + app + ports + devices.
#[derive(Debug)]
pub struct StreamSession {
    pub session_id: u64,
    pub display_width: u32,
    pub display_height: u32,
    pub display_fps: u32,
    pub support_hevc: bool,
    pub support_av1: bool,
    pub audio_channel_count: u8,
    pub aes_key: [u8; 16],
    pub aes_iv: [u8; 16],
    pub client_ip: IpAddr,
    pub app_id: u32,
    pub video_stream_port: u16,
    pub audio_stream_port: u16,
    pub input_devices: parking_lot::Mutex<InputDeviceHandles>,
    pub virtual_display: Option<u64>,
    pub last_control_seq: AtomicU32,
}

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

impl StreamSession {
    pub fn next_id() -> u64 {
        NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed) as u64
    }
}

/// Derived from an RTSP ANNOUNCE, fired onto the event bus to start the
/// video encoder pipeline.
#[derive(Debug, Clone)]
pub struct VideoSession {
    pub session_id: u64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: VideoCodec,
    pub bitrate_kbps: u32,
    pub packet_size: u32,
    pub fec_percentage: u32,
    pub min_required_fec_packets: u32,
    pub slices_per_frame: u32,
    pub color_range_jpeg: bool,
    pub color_space: u32,
}

#[derive(Debug, Clone)]
pub struct AudioSession {
    pub session_id: u64,
    pub channel_count: u8,
    pub bitrate_kbps: u32,
}

/// Lifecycle and control-channel events published onto the bus.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PairSignal { cache_key: String },
    VideoSession(VideoSession),
    AudioSession(AudioSession),
    ResumeStream { session_id: u64 },
    PauseStream { session_id: u64 },
    StopStream { session_id: u64 },
    RtpVideoPing { session_id: u64 },
    RtpAudioPing { session_id: u64 },
    ControlEvent { session_id: u64, packet_type: u16 },
    DeviceHotplug { session_id: u64, joypad_index: u8 },
}

/// Dependency-injected event bus. Subscriptions return an RAII guard;
/// dropping the guard unsubscribes (by dropping the underlying receiver).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

pub struct Subscription {
    receiver: broadcast::Receiver<SessionEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn publish(&self, event: SessionEvent) {
        // Observers are non-blocking by contract; publication itself never
        // waits for a receiver to be present.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(SessionEvent::ResumeStream { session_id: 1 });
        bus.publish(SessionEvent::PauseStream { session_id: 1 });
        bus.publish(SessionEvent::StopStream { session_id: 1 });

        assert!(matches!(
            sub.recv().await,
            Some(SessionEvent::ResumeStream { session_id: 1 })
        ));
        assert!(matches!(
            sub.recv().await,
            Some(SessionEvent::PauseStream { session_id: 1 })
        ));
        assert!(matches!(
            sub.recv().await,
            Some(SessionEvent::StopStream { session_id: 1 })
        ));
    }

    #[test]
    fn paired_client_identity_is_deterministic() {
        let client = PairedClient {
            client_cert_pem: "cert".into(),
            app_state_folder: "/tmp".into(),
            run_uid: 1000,
            run_gid: 1000,
        };
        assert_eq!(client.identity(), client.identity());
    }
}
