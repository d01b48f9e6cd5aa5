//! HTTPS (mTLS, port 47984) listener: `/serverinfo`, `/pair` phase 5,
//! `/applist`, `/launch`, `/resume`, `/cancel`.
//!
//! hyper 0.14 has no built-in TLS acceptor, so unlike `http.rs` this runs
//! its own accept loop over `tls::build_https_acceptor`'s `TlsAcceptor`
//! and drives each connection with `hyper::server::conn::Http` directly
//! (the same low-level pattern `streaming/health_server.rs`'s
//! `make_service_fn`/`Server::bind` wraps for the plaintext case).

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::{HostConfig, RunnerConfig};
use crate::error::{AuthError, FatalError, HostError};
use crate::host_info::HostProbe;
use crate::pairing::PairingService;
use crate::runner::docker::{DockerRunner, DockerRunnerConfig};
use crate::runner::process::{ProcessRunner, ProcessRunnerConfig};
use crate::runner::Runner;
use crate::session::coordinator::SessionCoordinator;
use crate::session::{PairedClient, StreamSession};
use crate::xml::RootWriter;

const APP_VERSION: &str = "7.1.431.0";
const GFE_VERSION: &str = "3.23.0.74";
const MAX_LUMA_PIXELS_HEVC: u32 = 1_869_449_984;
const CODEC_H264: u32 = 0x0001;
const CODEC_H265: u32 = 0x0100;
const CODEC_AV1_8: u32 = 0x1000;

pub struct HttpsServer {
    config: Arc<HostConfig>,
    pairing: Arc<PairingService>,
    coordinator: Arc<SessionCoordinator>,
    probe: Arc<dyn HostProbe>,
    acceptor: TlsAcceptor,
    http_port: u16,
    rtsp_port: u16,
}

impl HttpsServer {
    pub fn new(
        config: Arc<HostConfig>,
        pairing: Arc<PairingService>,
        coordinator: Arc<SessionCoordinator>,
        probe: Arc<dyn HostProbe>,
        acceptor: TlsAcceptor,
        http_port: u16,
        rtsp_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pairing,
            coordinator,
            probe,
            acceptor,
            http_port,
            rtsp_port,
        })
    }

    pub async fn run(self: Arc<Self>, bind_addr: SocketAddr) -> Result<(), HostError> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            HostError::Fatal(FatalError::ListenerBind {
                addr: bind_addr.to_string(),
                reason: e.to_string(),
            })
        })?;
        info!(%bind_addr, "HTTPS listener starting");

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "HTTPS accept failed");
                    continue;
                }
            };
            let this = self.clone();
            let acceptor = self.acceptor.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, %peer_addr, "TLS handshake failed");
                        return;
                    }
                };
                let peer_cert_der = tls_stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .map(|c| c.as_ref().to_vec());
                let peer_ip = peer_addr.ip();
                let service = service_fn(move |req| {
                    let this = this.clone();
                    let peer_cert_der = peer_cert_der.clone();
                    async move { Ok::<_, Infallible>(this.dispatch(req, peer_ip, peer_cert_der).await) }
                });
                if let Err(e) = Http::new().serve_connection(tls_stream, service).await {
                    warn!(error = %e, %peer_addr, "HTTPS connection error");
                }
            });
        }
    }

    async fn dispatch(
        &self,
        req: Request<Body>,
        peer_ip: IpAddr,
        peer_cert_der: Option<Vec<u8>>,
    ) -> Response<Body> {
        let Some(cert_der) = peer_cert_der else {
            warn!(%peer_ip, "HTTPS connection with no client certificate");
            return unauthorized();
        };

        let path = req.uri().path().to_string();
        match (req.method().clone(), path.as_str()) {
            (Method::GET, "/serverinfo") => self.serverinfo(&req, peer_ip, &cert_der),
            (Method::GET, "/pair") => self.pair(&req, peer_ip, &cert_der),
            (Method::GET, "/applist") => self.applist(),
            (Method::GET, "/launch") => self.launch(&req, peer_ip, &cert_der).await,
            (Method::GET, "/resume") => self.resume(&req, peer_ip, &cert_der),
            (Method::GET, "/cancel") => self.cancel(&req, peer_ip, &cert_der),
            _ => not_found(),
        }
    }

    /// Looks up the paired client bound to `cert_der`, or `None` if this
    /// certificate has never completed pairing.
    fn paired_client(&self, cert_der: &[u8]) -> Option<PairedClient> {
        self.pairing.find_paired(cert_der)
    }

    fn serverinfo(&self, req: &Request<Body>, peer_ip: IpAddr, cert_der: &[u8]) -> Response<Body> {
        let query = parse_query(req.uri().query().unwrap_or(""));
        let config = self.config.snapshot();
        let session = self.coordinator.find_by_ip(&peer_ip);
        let is_busy = session.is_some();
        let current_game = session.as_ref().map(|s| s.app_id).unwrap_or(0);

        let mut codec_modes = CODEC_H264;
        if config.support_hevc {
            codec_modes |= CODEC_H265;
        }
        if config.support_av1 {
            codec_modes |= CODEC_AV1_8;
        }

        let _ = query.get("uniqueid");
        let pair_status = if self.paired_client(cert_der).is_some() { 1 } else { 0 };

        let xml = RootWriter::new(200)
            .elem("hostname", &config.hostname)
            .elem("appversion", APP_VERSION)
            .elem("GfeVersion", GFE_VERSION)
            .elem("uniqueid", &config.uuid)
            .elem("MaxLumaPixelsHEVC", if config.support_hevc { MAX_LUMA_PIXELS_HEVC } else { 0 })
            .elem("ServerCodecModeSupport", codec_modes)
            .elem("HttpsPort", 47984)
            .elem("ExternalPort", self.http_port)
            .elem("mac", self.probe.mac_address())
            .elem("LocalIP", self.probe.local_ip())
            .with_children("SupportedDisplayMode", |w| {
                for mode in &config.display_modes {
                    w.child_nest("DisplayMode", |m| {
                        m.child_elem("Width", mode.width);
                        m.child_elem("Height", mode.height);
                        m.child_elem("RefreshRate", mode.refresh_rate);
                    });
                }
            })
            .elem("PairStatus", pair_status)
            .elem("currentgame", current_game)
            .elem("state", if is_busy { "SUNSHINE_SERVER_BUSY" } else { "SUNSHINE_SERVER_FREE" })
            .finish();
        xml_response(StatusCode::OK, xml)
    }

    /// Phase 5: `GET /pair?uniqueid=…&phrase=pairchallenge`. The client
    /// certificate was already matched at the TLS layer; this just
    /// confirms the pairing and drops the now-unneeded attempt state.
    fn pair(&self, req: &Request<Body>, peer_ip: IpAddr, cert_der: &[u8]) -> Response<Body> {
        let query = parse_query(req.uri().query().unwrap_or(""));
        let (Some(unique_id), Some(phrase)) = (query.get("uniqueid"), query.get("phrase")) else {
            return bad_request();
        };
        if phrase != "pairchallenge" {
            return bad_request();
        }
        let paired = self.pairing.phase5_confirm(unique_id, peer_ip, cert_der);
        let xml = RootWriter::new(200).elem("paired", if paired { 1 } else { 0 }).finish();
        xml_response(StatusCode::OK, xml)
    }

    fn applist(&self) -> Response<Body> {
        let apps = self.config.apps();
        let xml = RootWriter::new(200)
            .with_children("Apps", |w| {
                for app in &apps {
                    w.child_nest("App", |a| {
                        a.child_elem("AppTitle", &app.title);
                        a.child_elem("ID", app.id);
                        a.child_elem("IsHdrSupported", app.support_hdr as u8);
                    });
                }
            })
            .finish();
        xml_response(StatusCode::OK, xml)
    }

    async fn launch(&self, req: &Request<Body>, peer_ip: IpAddr, cert_der: &[u8]) -> Response<Body> {
        let Some(client) = self.paired_client(cert_der) else {
            return unauthorized();
        };
        let query = parse_query(req.uri().query().unwrap_or(""));
        let (session, runner) = match self.build_launch_session(&query, peer_ip) {
            Ok(pair) => pair,
            Err(e) => return launch_failure(&e),
        };
        match self.start_launch(session, client, runner).await {
            Ok(()) => {
                let xml = RootWriter::new(200)
                    .elem("sessionUrl0", format!("rtsp://{}:{}", self.probe.local_ip(), self.rtsp_port))
                    .finish();
                xml_response(StatusCode::OK, xml)
            }
            Err(e) => launch_failure(&e),
        }
    }

    fn resume(&self, req: &Request<Body>, peer_ip: IpAddr, cert_der: &[u8]) -> Response<Body> {
        if self.paired_client(cert_der).is_none() {
            return unauthorized();
        }
        if self.coordinator.find_by_ip(&peer_ip).is_none() {
            warn!(%peer_ip, "resume requested for an unregistered session");
        }
        let _ = req;
        let xml = RootWriter::new(200)
            .elem("sessionUrl0", format!("rtsp://{}:{}", self.probe.local_ip(), self.rtsp_port))
            .elem("resume", 1)
            .finish();
        xml_response(StatusCode::OK, xml)
    }

    fn cancel(&self, req: &Request<Body>, peer_ip: IpAddr, cert_der: &[u8]) -> Response<Body> {
        if self.paired_client(cert_der).is_none() {
            return unauthorized();
        }
        let _ = req;
        if let Some(session) = self.coordinator.find_by_ip(&peer_ip) {
            let coordinator = self.coordinator.clone();
            let session_id = session.session_id;
            tokio::spawn(async move { coordinator.stop_session(session_id).await });
        } else {
            warn!(%peer_ip, "cancel requested for an unregistered session");
        }
        let xml = RootWriter::new(200).elem("cancel", 1).finish();
        xml_response(StatusCode::OK, xml)
    }

    /// Resolves `appid`/`mode`/`rikey`/`rikeyid` into a `StreamSession` plus
    /// the `Runner` configured for that app, grounded on the original's
    /// `create_run_session` (mode splits on `x`, rikey/rikeyid become
    /// `aes_key`/`aes_iv` verbatim).
    fn build_launch_session(
        &self,
        query: &std::collections::HashMap<String, String>,
        peer_ip: IpAddr,
    ) -> Result<(StreamSession, Arc<dyn Runner>), HostError> {
        let appid: u32 = query
            .get("appid")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| HostError::ProtocolGrammar(crate::error::ProtocolError::MalformedPairRequest {
                field: "appid",
            }))?;
        let app = self.config.find_config_app(appid).ok_or(HostError::AuthFail(AuthError::UnknownClient))?;

        let mode = query.get("mode").map(String::as_str).unwrap_or("1920x1080x60");
        let mut parts = mode.split('x');
        let width: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1920);
        let height: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1080);
        let fps: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(60);

        let aes_key = hex_to_16(query.get("rikey").map(String::as_str).unwrap_or(""))?;
        let aes_iv = hex_to_16(query.get("rikeyid").map(String::as_str).unwrap_or(""))?;

        let config = self.config.snapshot();
        // Ports are reserved in `start_launch`, under the coordinator's
        // port lock; placeholder values here are overwritten before the
        // session is registered.
        let session = StreamSession {
            session_id: StreamSession::next_id(),
            display_width: width,
            display_height: height,
            display_fps: fps,
            support_hevc: config.support_hevc,
            support_av1: config.support_av1,
            audio_channel_count: 2,
            aes_key,
            aes_iv,
            client_ip: peer_ip,
            app_id: appid,
            video_stream_port: 0,
            audio_stream_port: 0,
            input_devices: parking_lot::Mutex::new(Default::default()),
            virtual_display: None,
            last_control_seq: std::sync::atomic::AtomicU32::new(0),
        };

        let runner = build_runner(&app.runner)?;
        Ok((session, runner))
    }

    async fn start_launch(
        &self,
        mut session: StreamSession,
        client: PairedClient,
        runner: Arc<dyn Runner>,
    ) -> Result<(), HostError> {
        let (video_port, audio_port) = self.coordinator.reserve_ports().await?;
        session.video_stream_port = video_port;
        session.audio_stream_port = audio_port;

        let app = self
            .config
            .find_config_app(session.app_id)
            .ok_or(HostError::AuthFail(AuthError::UnknownClient))?;

        self.coordinator
            .start_session(session, std::collections::BTreeMap::new(), client.app_state_folder, app.render_node, runner)
            .await?;
        Ok(())
    }
}

/// Constructs the `Runner` an app's `RunnerConfig` names. `Process` apps
/// run their command through `sh -c` rather than splitting it into an
/// argv themselves, matching the shape `RunnerConfig::default()` already
/// assumes (a single shell command line).
pub(crate) fn build_runner(cfg: &RunnerConfig) -> Result<Arc<dyn Runner>, HostError> {
    match cfg {
        RunnerConfig::Process { run_cmd } => {
            let runner = ProcessRunner::new(ProcessRunnerConfig {
                executable_path: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), run_cmd.clone()],
            })?;
            Ok(Arc::new(runner))
        }
        RunnerConfig::Docker { image } => Ok(Arc::new(DockerRunner::new(DockerRunnerConfig {
            image: image.clone(),
            extra_args: Vec::new(),
        }))),
    }
}

/// Decodes `hex` into exactly 16 bytes, truncating or zero-padding on the
/// right. Moonlight's `rikeyid` is frequently a short value (a handful of
/// hex digits); the host's `aes_iv` field is always 16 bytes.
fn hex_to_16(hex: &str) -> Result<[u8; 16], HostError> {
    let decoded = crate::crypto::from_hex(hex)?;
    let mut out = [0u8; 16];
    let n = decoded.len().min(16);
    out[..n].copy_from_slice(&decoded[..n]);
    Ok(out)
}

fn parse_query(query: &str) -> std::collections::HashMap<String, String> {
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect::<std::collections::HashMap<String, String>>()
}

fn launch_failure(err: &HostError) -> Response<Body> {
    error!(error = %err, "launch/resume/cancel failed");
    let xml = RootWriter::new(500).finish();
    xml_response(StatusCode::INTERNAL_SERVER_ERROR, xml)
}

fn xml_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/xml")
        .body(Body::from(body))
        .unwrap()
}

fn bad_request() -> Response<Body> {
    xml_response(StatusCode::BAD_REQUEST, RootWriter::new(400).finish())
}

fn not_found() -> Response<Body> {
    xml_response(StatusCode::NOT_FOUND, RootWriter::new(404).finish())
}

fn unauthorized() -> Response<Body> {
    xml_response(StatusCode::UNAUTHORIZED, RootWriter::new(401).finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_to_16_pads_short_values() {
        let out = hex_to_16("1c").unwrap();
        assert_eq!(out[0], 0x1c);
        assert_eq!(out[1..], [0u8; 15]);
    }

    #[test]
    fn hex_to_16_truncates_long_values() {
        let hex = "00112233445566778899aabbccddeeff0011223344";
        let out = hex_to_16(hex).unwrap();
        assert_eq!(out, [0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn build_runner_accepts_process_config() {
        let cfg = RunnerConfig::Process { run_cmd: "true".to_string() };
        assert!(build_runner(&cfg).is_ok());
    }
}
