//! The local REST admin surface (spec §6.7): a JSON API reachable only
//! over a Unix domain socket, for operator tooling and for starting
//! sessions programmatically without going through Moonlight pairing and
//! RTSP negotiation.
//!
//! Bound to a filesystem socket rather than a TCP port by design — the
//! admin surface is for processes sharing the host's filesystem
//! namespace, not the network. Wiring mirrors `https.rs`'s own
//! accept-loop/`hyper::server::conn::Http` pattern, substituted onto a
//! `UnixListener` instead of a `TcpListener` + TLS acceptor.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper::body::to_bytes;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use tokio::net::UnixListener;
use tracing::{error, info, warn};

use crate::config::HostConfig;
use crate::error::{FatalError, HostError};
use crate::runner::Runner;
use crate::session::coordinator::SessionCoordinator;
use crate::session::StreamSession;

#[derive(Serialize)]
struct SessionView {
    session_id: u64,
    app_id: u32,
    client_ip: String,
    video_stream_port: u16,
    audio_stream_port: u16,
    display_width: u32,
    display_height: u32,
    display_fps: u32,
}

impl From<&Arc<StreamSession>> for SessionView {
    fn from(s: &Arc<StreamSession>) -> Self {
        Self {
            session_id: s.session_id,
            app_id: s.app_id,
            client_ip: s.client_ip.to_string(),
            video_stream_port: s.video_stream_port,
            audio_stream_port: s.audio_stream_port,
            display_width: s.display_width,
            display_height: s.display_height,
            display_fps: s.display_fps,
        }
    }
}

#[derive(serde::Deserialize)]
struct LaunchRequest {
    app_id: u32,
    client_ip: std::net::IpAddr,
    display_width: u32,
    display_height: u32,
    display_fps: u32,
}

pub struct AdminServer {
    config: Arc<HostConfig>,
    coordinator: Arc<SessionCoordinator>,
}

impl AdminServer {
    pub fn new(config: Arc<HostConfig>, coordinator: Arc<SessionCoordinator>) -> Arc<Self> {
        Arc::new(Self { config, coordinator })
    }

    /// Binds `socket_path`, removing a stale socket file left behind by a
    /// previous unclean shutdown first.
    pub async fn run(self: Arc<Self>, socket_path: impl AsRef<Path>) -> Result<(), HostError> {
        let socket_path: PathBuf = socket_path.as_ref().to_path_buf();
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            HostError::Fatal(FatalError::ListenerBind {
                addr: socket_path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        info!(path = %socket_path.display(), "admin API listening");

        loop {
            let (stream, _addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "admin socket accept failed");
                    continue;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let this = this.clone();
                    async move { Ok::<_, Infallible>(this.dispatch(req).await) }
                });
                if let Err(e) = Http::new().serve_connection(stream, service).await {
                    warn!(error = %e, "admin connection closed with error");
                }
            });
        }
    }

    async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/sessions") => self.list_sessions(),
            (&Method::GET, "/apps") => self.list_apps(),
            (&Method::GET, "/paired-clients") => self.list_paired_clients(),
            (&Method::POST, "/sessions") => self.create_session(req).await,
            (&Method::DELETE, path) if path.starts_with("/sessions/") => {
                self.stop_session(&path["/sessions/".len()..])
            }
            _ => not_found(),
        }
    }

    fn list_sessions(&self) -> Response<Body> {
        let sessions: Vec<SessionView> = self.coordinator.list_sessions().iter().map(SessionView::from).collect();
        json_response(StatusCode::OK, &sessions)
    }

    fn list_apps(&self) -> Response<Body> {
        json_response(StatusCode::OK, &self.config.apps())
    }

    fn list_paired_clients(&self) -> Response<Body> {
        json_response(StatusCode::OK, &self.config.paired_clients())
    }

    fn stop_session(&self, id: &str) -> Response<Body> {
        let Ok(session_id) = id.parse::<u64>() else {
            return bad_request("session id must be an integer");
        };
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move { coordinator.stop_session(session_id).await });
        Response::builder().status(StatusCode::ACCEPTED).body(Body::empty()).unwrap()
    }

    /// Starts a session without a paired client, RTSP negotiation, or a
    /// control channel handshake — intended for headless operator
    /// tooling and local testing, not for client devices.
    async fn create_session(&self, req: Request<Body>) -> Response<Body> {
        let body = match to_bytes(req.into_body()).await {
            Ok(b) => b,
            Err(e) => return bad_request(&format!("failed to read request body: {e}")),
        };
        let launch: LaunchRequest = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => return bad_request(&format!("invalid request body: {e}")),
        };

        let Some(app) = self.config.find_config_app(launch.app_id) else {
            return not_found();
        };

        let (video_port, audio_port) = match self.coordinator.reserve_ports().await {
            Ok(ports) => ports,
            Err(e) => return error_response(&e),
        };

        let session = StreamSession {
            session_id: StreamSession::next_id(),
            display_width: launch.display_width,
            display_height: launch.display_height,
            display_fps: launch.display_fps,
            support_hevc: false,
            support_av1: false,
            audio_channel_count: 2,
            aes_key: rand::random(),
            aes_iv: rand::random(),
            client_ip: launch.client_ip,
            app_id: launch.app_id,
            video_stream_port: video_port,
            audio_stream_port: audio_port,
            input_devices: parking_lot::Mutex::new(Default::default()),
            virtual_display: None,
            last_control_seq: std::sync::atomic::AtomicU32::new(0),
        };

        let runner: Arc<dyn Runner> = match crate::https::build_runner(&app.runner) {
            Ok(r) => r,
            Err(e) => return error_response(&e),
        };

        let result = self
            .coordinator
            .start_session(
                session,
                Default::default(),
                format!("/tmp/moonlight-host/{}", launch.app_id),
                app.render_node.clone(),
                runner,
            )
            .await;

        match result {
            Ok(started) => json_response(StatusCode::CREATED, &SessionView::from(&started)),
            Err(e) => error_response(&e),
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap(),
        Err(e) => {
            error!(error = %e, "failed to serialize admin response");
            Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).body(Body::empty()).unwrap()
        }
    }
}

fn bad_request(message: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Body::from(message.to_string()))
        .unwrap()
}

fn not_found() -> Response<Body> {
    Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()).unwrap()
}

fn error_response(e: &HostError) -> Response<Body> {
    warn!(error = %e, "admin request failed");
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(Body::from(e.to_string()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_view_reports_reserved_ports() {
        let session = Arc::new(StreamSession {
            session_id: 42,
            display_width: 1920,
            display_height: 1080,
            display_fps: 60,
            support_hevc: false,
            support_av1: false,
            audio_channel_count: 2,
            aes_key: [0u8; 16],
            aes_iv: [0u8; 16],
            client_ip: "10.0.0.5".parse().unwrap(),
            app_id: 7,
            video_stream_port: 48100,
            audio_stream_port: 48200,
            input_devices: parking_lot::Mutex::new(Default::default()),
            virtual_display: None,
            last_control_seq: std::sync::atomic::AtomicU32::new(0),
        });
        let view = SessionView::from(&session);
        assert_eq!(view.session_id, 42);
        assert_eq!(view.video_stream_port, 48100);
        assert_eq!(view.client_ip, "10.0.0.5");
    }
}
