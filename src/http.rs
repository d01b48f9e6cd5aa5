//! Plaintext HTTP listener (port 47989): `/serverinfo`, `/pair` phases 1-4,
//! `/unpair`, and the operator PIN-entry page.
//!
//! Mirrors `streaming/health_server.rs`'s `make_service_fn`/`service_fn`
//! wiring; route dispatch replaces the health endpoints with the GameStream
//! surface from the original's `rest/endpoints.hpp`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::HostConfig;
use crate::error::HostError;
use crate::host_info::HostProbe;
use crate::pairing::PairingService;
use crate::session::coordinator::SessionCoordinator;
use crate::xml::RootWriter;

const APP_VERSION: &str = "7.1.431.0";
const GFE_VERSION: &str = "3.23.0.74";
const MAX_LUMA_PIXELS_HEVC: u32 = 1_869_449_984;
const CODEC_H264: u32 = 0x0001;
const CODEC_H265: u32 = 0x0100;
const CODEC_AV1_8: u32 = 0x1000;

pub struct HttpServer {
    config: Arc<HostConfig>,
    pairing: Arc<PairingService>,
    coordinator: Arc<SessionCoordinator>,
    probe: Arc<dyn HostProbe>,
    https_port: u16,
}

impl HttpServer {
    pub fn new(
        config: Arc<HostConfig>,
        pairing: Arc<PairingService>,
        coordinator: Arc<SessionCoordinator>,
        probe: Arc<dyn HostProbe>,
        https_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self { config, pairing, coordinator, probe, https_port })
    }

    pub async fn run(self: Arc<Self>, bind_addr: SocketAddr) -> Result<(), HostError> {
        let this = self.clone();
        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let this = this.clone();
            let peer_ip = conn.remote_addr().ip();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let this = this.clone();
                    async move { Ok::<_, Infallible>(this.dispatch(req, peer_ip).await) }
                }))
            }
        });

        info!(%bind_addr, "HTTP listener starting");
        Server::bind(&bind_addr)
            .serve(make_svc)
            .await
            .map_err(|e| HostError::Fatal(crate::error::FatalError::ListenerBind {
                addr: bind_addr.to_string(),
                reason: e.to_string(),
            }))
    }

    async fn dispatch(&self, req: Request<Body>, peer_ip: IpAddr) -> Response<Body> {
        let path = req.uri().path().to_string();
        match (req.method().clone(), path.as_str()) {
            (Method::GET, "/serverinfo") => self.serverinfo(&req, peer_ip),
            (Method::GET, "/pair") => self.pair(&req, peer_ip).await,
            (Method::GET, "/unpair") => self.unpair(&req, peer_ip),
            (Method::GET, "/pin/") => pin_page(),
            (Method::POST, "/pin/") => self.submit_pin(req).await,
            _ => not_found(),
        }
    }

    fn serverinfo(&self, req: &Request<Body>, peer_ip: IpAddr) -> Response<Body> {
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

        // `/serverinfo` carries no client certificate over plaintext HTTP;
        // pairing status can only be asserted once the client authenticates
        // via mTLS on the HTTPS listener (see https::serverinfo).
        let _ = query.get("uniqueid");
        let pair_status = 0;

        let xml = RootWriter::new(200)
            .elem("hostname", &config.hostname)
            .elem("appversion", APP_VERSION)
            .elem("GfeVersion", GFE_VERSION)
            .elem("uniqueid", &config.uuid)
            .elem("MaxLumaPixelsHEVC", if config.support_hevc { MAX_LUMA_PIXELS_HEVC } else { 0 })
            .elem("ServerCodecModeSupport", codec_modes)
            .elem("HttpsPort", self.https_port)
            .elem("ExternalPort", 47989)
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

    async fn pair(&self, req: &Request<Body>, peer_ip: IpAddr) -> Response<Body> {
        let query = parse_query(req.uri().query().unwrap_or(""));
        let Some(unique_id) = query.get("uniqueid") else {
            warn!("pair request missing uniqueid");
            return bad_request();
        };

        if let (Some(salt), Some(client_cert)) = (query.get("salt"), query.get("clientcert")) {
            return match self
                .pairing
                .phase1_get_server_cert(unique_id, peer_ip, salt, client_cert)
                .await
            {
                Ok(cert_hex) => {
                    let xml = RootWriter::new(200).elem("paired", 1).elem("plaincert", cert_hex).finish();
                    xml_response(StatusCode::OK, xml)
                }
                Err(e) => pair_failure(&e),
            };
        }

        if let Some(challenge) = query.get("clientchallenge") {
            return match self.pairing.phase2_client_challenge(unique_id, peer_ip, challenge) {
                Ok(response_hex) => {
                    let xml = RootWriter::new(200)
                        .elem("paired", 1)
                        .elem("challengeresponse", response_hex)
                        .finish();
                    xml_response(StatusCode::OK, xml)
                }
                Err(e) => pair_failure(&e),
            };
        }

        if let Some(resp) = query.get("serverchallengeresp") {
            return match self.pairing.phase3_server_challenge_response(unique_id, peer_ip, resp) {
                Ok(pairing_secret_hex) => {
                    let xml = RootWriter::new(200)
                        .elem("paired", 1)
                        .elem("pairingsecret", pairing_secret_hex)
                        .finish();
                    xml_response(StatusCode::OK, xml)
                }
                Err(e) => pair_failure(&e),
            };
        }

        if let Some(secret) = query.get("clientpairingsecret") {
            let app_state_folder = format!("client-{unique_id}");
            return match self
                .pairing
                .phase4_client_pairing_secret(unique_id, peer_ip, secret, app_state_folder, 1000, 1000)
            {
                Ok(Some(paired)) => {
                    if let Err(e) = self.config.pair(&paired) {
                        error!(error = %e, "failed to persist newly paired client");
                    }
                    let xml = RootWriter::new(200).elem("paired", 1).finish();
                    xml_response(StatusCode::OK, xml)
                }
                Ok(None) => {
                    let xml = RootWriter::new(200).elem("paired", 0).finish();
                    xml_response(StatusCode::OK, xml)
                }
                Err(e) => pair_failure(&e),
            };
        }

        warn!(unique_id, "pair request matched no known phase");
        bad_request()
    }

    fn unpair(&self, req: &Request<Body>, peer_ip: IpAddr) -> Response<Body> {
        let query = parse_query(req.uri().query().unwrap_or(""));
        let Some(unique_id) = query.get("uniqueid") else {
            return bad_request();
        };
        info!(unique_id, %peer_ip, "unpair requested");
        if let Some(removed) = self.pairing.unpair_by_cache_key(unique_id, peer_ip) {
            if let Err(e) = self.config.unpair(&removed.client_cert_pem) {
                error!(error = %e, "failed to persist unpair");
            }
        } else {
            warn!(unique_id, "no pairing-cache entry for unpair request");
        }
        let xml = RootWriter::new(200).finish();
        xml_response(StatusCode::OK, xml)
    }

    async fn submit_pin(&self, req: Request<Body>) -> Response<Body> {
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
        let Ok(payload) = serde_json::from_slice::<PinSubmission>(&body) else {
            return bad_request();
        };
        let resolved = self.pairing.submit_pin(&payload.secret, payload.pin).await;
        let body = serde_json::json!({ "ok": resolved });
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}

#[derive(Deserialize)]
struct PinSubmission {
    pin: String,
    secret: String,
}

fn pair_failure(err: &HostError) -> Response<Body> {
    error!(error = %err, "pairing phase failed");
    let xml = RootWriter::new(200).elem("paired", 0).finish();
    xml_response(StatusCode::OK, xml)
}

fn parse_query(query: &str) -> HashMap<String, String> {
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect::<HashMap<String, String>>()
}

fn xml_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/xml")
        .body(Body::from(body))
        .unwrap()
}

fn bad_request() -> Response<Body> {
    let xml = RootWriter::new(400).finish();
    xml_response(StatusCode::BAD_REQUEST, xml)
}

fn not_found() -> Response<Body> {
    let xml = RootWriter::new(404).finish();
    xml_response(StatusCode::NOT_FOUND, xml)
}

fn pin_page() -> Response<Body> {
    const PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Moonlight host pairing</title></head>
<body>
<h1>Enter the PIN shown on the client</h1>
<form id="pin-form">
  <input type="text" id="pin" name="pin" maxlength="4" pattern="[0-9]{4}">
  <input type="hidden" id="secret" name="secret">
  <button type="submit">Pair</button>
</form>
<script>
document.getElementById('pin-form').addEventListener('submit', async (ev) => {
  ev.preventDefault();
  const pin = document.getElementById('pin').value;
  const secret = new URLSearchParams(location.search).get('secret') || '';
  await fetch('/pin/', {
    method: 'POST',
    headers: { 'content-type': 'application/json' },
    body: JSON.stringify({ pin, secret }),
  });
});
</script>
</body>
</html>
"#;
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/html")
        .body(Body::from(PAGE))
        .unwrap()
}
