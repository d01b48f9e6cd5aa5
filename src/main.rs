use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tracing::info;

use moonlight_host::config::HostConfig;
use moonlight_host::control::server::ControlServer;
use moonlight_host::control::CONTROL_PORT;
use moonlight_host::encoder::{EncoderSupervisor, GstLaunchPipeline};
use moonlight_host::health::{run_health_monitoring, HealthMonitor};
use moonlight_host::host_info::LinuxHostProbe;
use moonlight_host::http::HttpServer;
use moonlight_host::identity::{self, IdentityPaths};
use moonlight_host::input_interpreter::InputInterpreter;
use moonlight_host::input_sink::LoggingInputSink;
use moonlight_host::pairing::PairingService;
use moonlight_host::runner::NullRunner;
use moonlight_host::rtsp::server::RtspServer;
use moonlight_host::session::coordinator::SessionCoordinator;
use moonlight_host::session::EventBus;

#[cfg(feature = "tls")]
use moonlight_host::https::HttpsServer;
#[cfg(feature = "tls")]
use moonlight_host::tls;

const HTTP_PORT: u16 = 47989;
const HTTPS_PORT: u16 = 47984;
const RTSP_PORT: u16 = 48010;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    dotenv::dotenv().ok();

    let state_dir = std::env::var("MOONLIGHT_HOST_STATE_DIR").unwrap_or_else(|_| "/var/lib/moonlight-host".to_string());
    std::fs::create_dir_all(&state_dir).with_context(|| format!("creating state dir {state_dir}"))?;

    let config = HostConfig::load_or_default(format!("{state_dir}/config.toml"))
        .context("loading host configuration")?;

    let identity = identity::load_or_generate(&IdentityPaths {
        cert_pem: format!("{state_dir}/host.pem").into(),
        key_pem: format!("{state_dir}/host.key").into(),
    })
    .context("loading or generating host identity")?;

    let bus = Arc::new(EventBus::new());
    let coordinator = SessionCoordinator::new(bus.clone(), Arc::new(NullRunner));
    coordinator.clone().spawn_hotplug_bridge();
    let pairing = PairingService::new(identity.clone(), bus.clone());
    let probe = Arc::new(LinuxHostProbe);

    let input_interpreter = Arc::new(InputInterpreter::new(Arc::new(LoggingInputSink), bus.clone()));

    let video_pipeline = Arc::new(GstLaunchPipeline::new());
    let audio_pipeline = Arc::new(GstLaunchPipeline::new());
    EncoderSupervisor::new(config.clone(), coordinator.clone(), video_pipeline, audio_pipeline).spawn();

    let health_monitor = Arc::new(HealthMonitor::new(
        env!("CARGO_PKG_VERSION").to_string(),
        config.clone(),
        coordinator.clone(),
    ));
    tokio::spawn(run_health_monitoring(health_monitor));

    let http_server = HttpServer::new(config.clone(), pairing.clone(), coordinator.clone(), probe.clone(), HTTPS_PORT);
    let http_task = tokio::spawn(http_server.run(bind(HTTP_PORT)));

    #[cfg(feature = "tls")]
    let https_task = {
        let acceptor = tls::build_https_acceptor(&identity).context("building mTLS acceptor")?;
        let https_server = HttpsServer::new(
            config.clone(),
            pairing.clone(),
            coordinator.clone(),
            probe.clone(),
            acceptor,
            HTTP_PORT,
            RTSP_PORT,
        );
        tokio::spawn(https_server.run(bind(HTTPS_PORT)))
    };

    let rtsp_listener = TcpListener::bind(bind(RTSP_PORT)).await.context("binding RTSP listener")?;
    let rtsp_server = RtspServer::new(coordinator.clone(), config.snapshot().support_hevc, config.snapshot().support_av1);
    let rtsp_task = tokio::spawn(rtsp_server.run(rtsp_listener));

    let control_socket = UdpSocket::bind(bind(CONTROL_PORT)).await.context("binding control channel socket")?;
    let control_server = ControlServer::new(coordinator.clone(), input_interpreter.clone());
    let control_task = tokio::spawn(control_server.run(control_socket));

    #[cfg(feature = "tls")]
    let admin_task = {
        let admin_socket = std::env::var("MOONLIGHT_HOST_ADMIN_SOCKET")
            .unwrap_or_else(|_| format!("{state_dir}/admin.sock"));
        let admin_server = moonlight_host::admin::AdminServer::new(config.clone(), coordinator.clone());
        tokio::spawn(async move { admin_server.run(admin_socket).await })
    };

    info!(%state_dir, http_port = HTTP_PORT, https_port = HTTPS_PORT, rtsp_port = RTSP_PORT, "moonlight-host is up");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        res = http_task => log_task_exit("http", res),
        res = rtsp_task => log_task_exit("rtsp", res),
        res = control_task => log_task_exit("control", res),
        #[cfg(feature = "tls")]
        res = https_task => log_task_exit("https", res),
        #[cfg(feature = "tls")]
        res = admin_task => log_task_exit("admin", res),
    }

    Ok(())
}

fn bind(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

fn log_task_exit<E: std::fmt::Display>(name: &str, result: Result<Result<(), E>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!(task = name, "listener task exited"),
        Ok(Err(e)) => tracing::error!(task = name, error = %e, "listener task failed"),
        Err(e) => tracing::error!(task = name, error = %e, "listener task panicked"),
    }
}
