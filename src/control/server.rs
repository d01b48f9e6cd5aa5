//! The UDP control-channel server: identifies peers by source IP against
//! the live session set, decrypts `ENCRYPTED` frames, and dispatches the
//! nested packet per the connection lifecycle.
//!
//! A from-scratch ENet peer state machine (connect/disconnect timeouts,
//! retransmission) is out of scope; this loop relies on UDP best-effort
//! delivery and treats "first packet from a known peer" as connect. True
//! ENet disconnect detection is left as an open question (see DESIGN.md).

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashSet;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::control::{self, PACKET_TYPE_INPUT_DATA, PACKET_TYPE_TERMINATION, TERMINATION_REASON};
use crate::error::HostError;
use crate::input_interpreter::InputInterpreter;
use crate::session::coordinator::SessionCoordinator;
use crate::session::SessionEvent;

const RECV_BUFFER_SIZE: usize = 65536;

pub struct ControlServer {
    coordinator: Arc<SessionCoordinator>,
    interpreter: Arc<InputInterpreter>,
    connected: DashSet<u64>,
}

impl ControlServer {
    pub fn new(coordinator: Arc<SessionCoordinator>, interpreter: Arc<InputInterpreter>) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            interpreter,
            connected: DashSet::new(),
        })
    }

    /// Drive the UDP accept/dispatch loop until the socket errors out.
    pub async fn run(self: Arc<Self>, socket: UdpSocket) -> Result<(), HostError> {
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, peer) = socket.recv_from(&mut buffer).await.map_err(HostError::Io)?;
            self.handle_packet(&socket, peer, &buffer[..len]).await;
        }
    }

    async fn handle_packet(&self, socket: &UdpSocket, peer: SocketAddr, raw: &[u8]) {
        let Some(session) = self.coordinator.find_by_ip(&peer.ip()) else {
            warn!(%peer, "control packet from unknown peer, forcing disconnect");
            return;
        };

        let header = match control::ControlHeader::from_bytes(raw) {
            Some(h) => h,
            None => {
                warn!(session_id = session.session_id, "truncated control packet, dropped");
                return;
            }
        };
        if header.packet_type != control::PACKET_TYPE_ENCRYPTED {
            warn!(
                session_id = session.session_id,
                packet_type = header.packet_type,
                "rejecting unencrypted non-handshake control packet"
            );
            return;
        }

        let nested = match control::decrypt_frame(&session.aes_key, raw) {
            Ok(nested) => nested,
            Err(e) => {
                warn!(session_id = session.session_id, error = %e, "control frame decryption failed, dropped");
                return;
            }
        };

        if self.connected.insert(session.session_id) {
            debug!(session_id = session.session_id, "control channel connected, resuming stream");
            self.coordinator.event_bus().publish(SessionEvent::ResumeStream {
                session_id: session.session_id,
            });
        }

        match nested.packet_type {
            PACKET_TYPE_TERMINATION => {
                self.connected.remove(&session.session_id);
                self.coordinator.event_bus().publish(SessionEvent::PauseStream {
                    session_id: session.session_id,
                });
            }
            PACKET_TYPE_INPUT_DATA => {
                if let Err(e) = self.interpreter.dispatch(session.session_id, &nested.payload) {
                    warn!(session_id = session.session_id, error = %e, "malformed INPUT_DATA, dropped");
                }
            }
            other => {
                self.coordinator.event_bus().publish(SessionEvent::ControlEvent {
                    session_id: session.session_id,
                    packet_type: other,
                });
            }
        }

        let _ = socket;
    }

    /// Send an encrypted `TERMINATION` to the peer on server-initiated stop.
    pub async fn send_termination(
        &self,
        socket: &UdpSocket,
        peer: SocketAddr,
        aes_key: &[u8; 16],
        seq_counter: &std::sync::atomic::AtomicU32,
    ) -> Result<(), HostError> {
        let seq = seq_counter.fetch_add(1, Ordering::SeqCst);
        let nested = control::NestedPacket {
            packet_type: PACKET_TYPE_TERMINATION,
            payload: TERMINATION_REASON.to_be_bytes().to_vec(),
        };
        let frame = control::encrypt_frame(aes_key, seq, &nested)?;
        socket.send_to(&frame, peer).await.map_err(HostError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::NullRunner;
    use crate::session::EventBus;
    use std::sync::atomic::AtomicU32;

    fn coordinator() -> Arc<SessionCoordinator> {
        SessionCoordinator::new(Arc::new(EventBus::new()), Arc::new(NullRunner))
    }

    #[tokio::test]
    async fn unknown_peer_is_ignored_without_panicking() {
        let coord = coordinator();
        let server = ControlServer::new(
            coord.clone(),
            Arc::new(InputInterpreter::new(
                Arc::new(crate::input_sink::LoggingInputSink),
                coord.event_bus(),
            )),
        );
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        server
            .handle_packet(&socket, "203.0.113.5:9".parse().unwrap(), &[0, 0, 0, 0])
            .await;
    }

    #[tokio::test]
    async fn termination_seq_advances() {
        let counter = AtomicU32::new(0);
        let socket_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = socket_b.local_addr().unwrap();
        let coord = coordinator();
        let server = ControlServer::new(
            coord.clone(),
            Arc::new(InputInterpreter::new(
                Arc::new(crate::input_sink::LoggingInputSink),
                coord.event_bus(),
            )),
        );
        let key = [0x22u8; 16];
        server.send_termination(&socket_a, peer, &key, &counter).await.unwrap();
        server.send_termination(&socket_a, peer, &key, &counter).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
