//! Session coordinator: reserves ports, drives the Runner, and owns the
//! live-session snapshot.
//!
//! The live-sessions set and the port pools are held behind `ArcSwap`
//! immutable snapshots: writers clone-with-update then swap the root
//! pointer, readers dereference a snapshot for the duration of a request
//! (no locks on the read path).

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{HostError, ResourceError, TimeoutError};
use crate::runner::{HotplugEvent, Runner};
use crate::session::{EventBus, SessionEvent, SharedEventBus, StreamSession};

/// The conventional uinput joystick device node for a controller slot.
/// The in-tree `LoggingInputSink` doesn't create real device nodes, but
/// this is the path a uinput-backed sink would hand to the runner.
fn joypad_device_path(joypad_index: u8) -> PathBuf {
    PathBuf::from(format!("/dev/input/js{joypad_index}"))
}

/// Everything the coordinator needs to reach a live session's runner:
/// the hot-plug queue it was launched with, and the runner handle itself
/// so `stop_session` can tear the process/container down.
struct SessionRuntime {
    runner: Arc<dyn Runner>,
    hotplug_tx: flume::Sender<HotplugEvent>,
}

const VIDEO_PORT_BASE: u16 = 48100;
const AUDIO_PORT_BASE: u16 = 48200;
const RTP_PING_TIMEOUT: Duration = Duration::from_millis(4000);

#[derive(Default, Clone)]
struct LiveSessions {
    by_id: BTreeMap<u64, Arc<StreamSession>>,
}

impl LiveSessions {
    fn used_video_ports(&self) -> Vec<u16> {
        self.by_id.values().map(|s| s.video_stream_port).collect()
    }

    fn used_audio_ports(&self) -> Vec<u16> {
        self.by_id.values().map(|s| s.audio_stream_port).collect()
    }

    fn by_ip(&self, ip: &IpAddr) -> Option<Arc<StreamSession>> {
        self.by_id.values().find(|s| &s.client_ip == ip).cloned()
    }
}

/// Scan the set of used ports starting from `base`, returning the lowest
/// free one. Freed lower ports are naturally preferred since the scan
/// always starts at `base`.
fn lowest_free_port(base: u16, used: &[u16]) -> Option<u16> {
    for candidate in base..base.saturating_add(1000) {
        if !used.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PingKind {
    Video,
    Audio,
}

pub struct SessionCoordinator {
    live: ArcSwap<LiveSessions>,
    port_lock: AsyncMutex<()>,
    bus: SharedEventBus,
    ping_waits: AsyncMutex<BTreeMap<(u64, PingKind), CancellationToken>>,
    runner: Arc<dyn Runner>,
    runtimes: DashMap<u64, SessionRuntime>,
}

impl SessionCoordinator {
    pub fn new(bus: SharedEventBus, runner: Arc<dyn Runner>) -> Arc<Self> {
        Arc::new(Self {
            live: ArcSwap::from_pointee(LiveSessions::default()),
            port_lock: AsyncMutex::new(()),
            bus,
            ping_waits: AsyncMutex::new(BTreeMap::new()),
            runner,
            runtimes: DashMap::new(),
        })
    }

    /// Subscribes to the event bus and forwards `DeviceHotplug` events to
    /// the originating session's runner queue. Spawned once, after
    /// construction, alongside the coordinator's other background tasks.
    pub fn spawn_hotplug_bridge(self: Arc<Self>) {
        let mut sub = self.bus.subscribe();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                if let SessionEvent::DeviceHotplug { session_id, joypad_index } = event {
                    self.notify_hotplug(session_id, joypad_device_path(joypad_index));
                }
            }
        });
    }

    /// Pushes a device-add event onto a live session's runner queue.
    /// A no-op (with a warning) once the session has stopped or if it
    /// never existed — mirrors `stop_session`'s at-most-once teardown.
    pub fn notify_hotplug(&self, session_id: u64, device_path: PathBuf) {
        match self.runtimes.get(&session_id) {
            Some(runtime) if runtime.hotplug_tx.send(HotplugEvent { device_path }).is_ok() => {}
            Some(_) => warn!(session_id, "hotplug queue closed, runner likely already exited"),
            None => warn!(session_id, "hotplug event for unknown or already-stopped session"),
        }
    }

    pub fn event_bus(&self) -> SharedEventBus {
        self.bus.clone()
    }

    pub fn default_runner(&self) -> Arc<dyn Runner> {
        self.runner.clone()
    }

    pub fn find_by_ip(&self, ip: &IpAddr) -> Option<Arc<StreamSession>> {
        self.live.load().by_ip(ip)
    }

    pub fn find_by_id(&self, session_id: u64) -> Option<Arc<StreamSession>> {
        self.live.load().by_id.get(&session_id).cloned()
    }

    /// Snapshot of every currently live session, for the admin API.
    pub fn list_sessions(&self) -> Vec<Arc<StreamSession>> {
        self.live.load().by_id.values().cloned().collect()
    }

    /// Reserve a disjoint `(video_port, audio_port)` pair under the port
    /// lock, computed against the current snapshot.
    pub async fn reserve_ports(&self) -> Result<(u16, u16), HostError> {
        let _guard = self.port_lock.lock().await;
        let snapshot = self.live.load();
        let video_port = lowest_free_port(VIDEO_PORT_BASE, &snapshot.used_video_ports())
            .ok_or(HostError::ResourceUnavailable(ResourceError::NoFreePort {
                pool_base: VIDEO_PORT_BASE,
            }))?;
        let audio_port = lowest_free_port(AUDIO_PORT_BASE, &snapshot.used_audio_ports())
            .ok_or(HostError::ResourceUnavailable(ResourceError::NoFreePort {
                pool_base: AUDIO_PORT_BASE,
            }))?;
        Ok((video_port, audio_port))
    }

    /// Register a newly created session and launch its application using
    /// `runner`. Each app may have its own launch command (process or
    /// docker), so the runner is supplied per call rather than fixed at
    /// coordinator construction; `self.runner` remains the default used by
    /// callers (tests, the bypass-Moonlight admin API) with no app-specific
    /// runner of their own.
    pub async fn start_session(
        self: &Arc<Self>,
        session: StreamSession,
        environment: BTreeMap<String, String>,
        app_state_folder: String,
        render_node: String,
        runner: Arc<dyn Runner>,
    ) -> Result<Arc<StreamSession>, HostError> {
        let session = Arc::new(session);
        {
            let current = self.live.load();
            let mut updated = (**current).clone();
            updated.by_id.insert(session.session_id, session.clone());
            self.live.store(Arc::new(updated));
        }

        let (hotplug_tx, hotplug_rx) = flume::unbounded();
        self.runtimes.insert(
            session.session_id,
            SessionRuntime {
                runner: runner.clone(),
                hotplug_tx,
            },
        );

        let session_for_runner = session.clone();
        tokio::spawn(async move {
            if let Err(e) = runner
                .run(
                    session_for_runner.session_id,
                    app_state_folder,
                    hotplug_rx,
                    Vec::new(),
                    Vec::new(),
                    environment,
                    render_node,
                )
                .await
            {
                warn!(session_id = session_for_runner.session_id, error = %e, "runner exited with error");
            }
        });

        Ok(session)
    }

    /// Wait asynchronously for the first RTP video ping for `session_id`, up
    /// to 4000ms. A newer VideoSession for the same id cancels the previous
    /// wait.
    pub async fn await_first_rtp_ping(self: &Arc<Self>, session_id: u64) -> Result<(), HostError> {
        self.await_ping(session_id, PingKind::Video).await
    }

    /// Same contract as `await_first_rtp_ping` for the audio stream's ping.
    /// Tracked independently: an audio re-announce never cancels a pending
    /// video wait for the same session and vice versa.
    pub async fn await_first_rtp_audio_ping(self: &Arc<Self>, session_id: u64) -> Result<(), HostError> {
        self.await_ping(session_id, PingKind::Audio).await
    }

    async fn await_ping(self: &Arc<Self>, session_id: u64, kind: PingKind) -> Result<(), HostError> {
        let token = {
            let mut waits = self.ping_waits.lock().await;
            if let Some(old) = waits.remove(&(session_id, kind)) {
                old.cancel();
            }
            let token = CancellationToken::new();
            waits.insert((session_id, kind), token.clone());
            token
        };

        let mut sub = self.bus.subscribe();
        let wait = async {
            loop {
                match sub.recv().await {
                    Some(SessionEvent::RtpVideoPing { session_id: sid }) if kind == PingKind::Video && sid == session_id => {
                        return Ok(());
                    }
                    Some(SessionEvent::RtpAudioPing { session_id: sid }) if kind == PingKind::Audio && sid == session_id => {
                        return Ok(());
                    }
                    Some(_) => continue,
                    None => return Err(HostError::Internal("event bus closed".into())),
                }
            }
        };

        tokio::select! {
            result = wait => result,
            _ = token.cancelled() => Err(HostError::Internal("superseded by a newer stream announce".into())),
            _ = tokio::time::sleep(RTP_PING_TIMEOUT) => {
                Err(HostError::Timeout(TimeoutError::RtpPing(RTP_PING_TIMEOUT)))
            }
        }
    }

    /// Tear down a session: publish `Stop`, remove from the live set.
    /// Delivered at-most-once per session by construction (removal makes
    /// a second call a no-op).
    pub async fn stop_session(&self, session_id: u64) {
        let removed = {
            let current = self.live.load();
            if !current.by_id.contains_key(&session_id) {
                return;
            }
            let mut updated = (**current).clone();
            updated.by_id.remove(&session_id);
            self.live.store(Arc::new(updated));
            true
        };
        if removed {
            info!(session_id, "tearing down stream session");
            if let Some((_, runtime)) = self.runtimes.remove(&session_id) {
                if let Err(e) = runtime.runner.stop(session_id).await {
                    warn!(session_id, error = %e, "failed to stop runner for session");
                }
            }
            self.bus.publish(SessionEvent::StopStream { session_id });
        }
    }

    pub fn pause_session(&self, session_id: u64) {
        self.bus.publish(SessionEvent::PauseStream { session_id });
    }

    pub fn resume_session(&self, session_id: u64) {
        self.bus.publish(SessionEvent::ResumeStream { session_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Drains its hot-plug queue into a shared log and records `stop`
    /// calls, so tests can observe both without a real process/container.
    struct RecordingRunner {
        stopped: Arc<StdMutex<Vec<u64>>>,
        hotplug_events: Arc<StdMutex<Vec<PathBuf>>>,
    }

    #[async_trait]
    impl Runner for RecordingRunner {
        async fn run(
            &self,
            _session_id: u64,
            _app_state_folder: String,
            hotplug_queue: flume::Receiver<HotplugEvent>,
            _input_device_paths: Vec<PathBuf>,
            _mount_paths: Vec<PathBuf>,
            _environment: BTreeMap<String, String>,
            _render_node: String,
        ) -> Result<(), HostError> {
            while let Ok(event) = hotplug_queue.recv_async().await {
                self.hotplug_events.lock().unwrap().push(event.device_path);
            }
            Ok(())
        }

        async fn stop(&self, session_id: u64) -> Result<(), HostError> {
            self.stopped.lock().unwrap().push(session_id);
            Ok(())
        }
    }

    fn test_session(video_port: u16, audio_port: u16) -> StreamSession {
        StreamSession {
            session_id: StreamSession::next_id(),
            display_width: 1920,
            display_height: 1080,
            display_fps: 60,
            support_hevc: false,
            support_av1: false,
            audio_channel_count: 2,
            aes_key: [0u8; 16],
            aes_iv: [0u8; 16],
            client_ip: "127.0.0.1".parse().unwrap(),
            app_id: 1,
            video_stream_port: video_port,
            audio_stream_port: audio_port,
            input_devices: parking_lot::Mutex::new(Default::default()),
            virtual_display: None,
            last_control_seq: std::sync::atomic::AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn notify_hotplug_forwards_to_the_session_runner() {
        let stopped = Arc::new(StdMutex::new(Vec::new()));
        let hotplug_events = Arc::new(StdMutex::new(Vec::new()));
        let runner: Arc<dyn Runner> = Arc::new(RecordingRunner {
            stopped: stopped.clone(),
            hotplug_events: hotplug_events.clone(),
        });

        let coordinator = SessionCoordinator::new(Arc::new(EventBus::new()), runner.clone());
        let (video_port, audio_port) = coordinator.reserve_ports().await.unwrap();
        let session = test_session(video_port, audio_port);
        let session_id = session.session_id;
        coordinator
            .start_session(session, BTreeMap::new(), "/tmp".into(), "/dev/dri/renderD128".into(), runner)
            .await
            .unwrap();

        coordinator.notify_hotplug(session_id, PathBuf::from("/dev/input/js3"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hotplug_events.lock().unwrap().as_slice(), &[PathBuf::from("/dev/input/js3")]);

        coordinator.stop_session(session_id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stopped.lock().unwrap().as_slice(), &[session_id]);

        // The runtime entry is gone once stopped; a late hot-plug is a dropped no-op.
        coordinator.notify_hotplug(session_id, PathBuf::from("/dev/input/js4"));
        assert_eq!(hotplug_events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn device_hotplug_event_bridges_to_the_runner_queue() {
        let stopped = Arc::new(StdMutex::new(Vec::new()));
        let hotplug_events = Arc::new(StdMutex::new(Vec::new()));
        let runner: Arc<dyn Runner> = Arc::new(RecordingRunner {
            stopped,
            hotplug_events: hotplug_events.clone(),
        });

        let bus = Arc::new(EventBus::new());
        let coordinator = SessionCoordinator::new(bus.clone(), runner.clone());
        coordinator.clone().spawn_hotplug_bridge();

        let (video_port, audio_port) = coordinator.reserve_ports().await.unwrap();
        let session = test_session(video_port, audio_port);
        let session_id = session.session_id;
        coordinator
            .start_session(session, BTreeMap::new(), "/tmp".into(), "/dev/dri/renderD128".into(), runner)
            .await
            .unwrap();

        bus.publish(SessionEvent::DeviceHotplug { session_id, joypad_index: 2 });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hotplug_events.lock().unwrap().as_slice(), &[PathBuf::from("/dev/input/js2")]);
    }

    #[test]
    fn port_allocation_prefers_lowest_free() {
        assert_eq!(lowest_free_port(48100, &[]), Some(48100));
        assert_eq!(lowest_free_port(48100, &[48100]), Some(48101));
        assert_eq!(lowest_free_port(48100, &[48100, 48101, 48103]), Some(48102));
    }

    #[tokio::test]
    async fn reserved_ports_are_disjoint_across_sessions() {
        let runner: Arc<dyn Runner> = Arc::new(crate::runner::NullRunner);
        let coordinator = SessionCoordinator::new(Arc::new(EventBus::new()), runner);
        let (v1, a1) = coordinator.reserve_ports().await.unwrap();
        assert_ne!(v1, a1);

        let session = StreamSession {
            session_id: StreamSession::next_id(),
            display_width: 1920,
            display_height: 1080,
            display_fps: 60,
            support_hevc: false,
            support_av1: false,
            audio_channel_count: 2,
            aes_key: [0u8; 16],
            aes_iv: [0u8; 16],
            client_ip: "127.0.0.1".parse().unwrap(),
            app_id: 1,
            video_stream_port: v1,
            audio_stream_port: a1,
            input_devices: parking_lot::Mutex::new(Default::default()),
            virtual_display: None,
            last_control_seq: std::sync::atomic::AtomicU32::new(0),
        };
        let runner = coordinator.default_runner();
        coordinator
            .start_session(session, BTreeMap::new(), "/tmp".into(), "/dev/dri/renderD128".into(), runner)
            .await
            .unwrap();

        let (v2, a2) = coordinator.reserve_ports().await.unwrap();
        assert_ne!(v1, v2);
        assert_ne!(a1, a2);
    }
}
