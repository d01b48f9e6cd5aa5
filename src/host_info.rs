//! Host network identity probe: MAC address and local IP for `/serverinfo`.
//!
//! A much-reduced cousin of the original's `platforms/hw_linux.cpp`, which
//! also resolves GPU render-node topology (PCI/DRM device linking) — that
//! part is out of scope here since this crate takes `render_node` as a
//! config string rather than discovering it.

use std::net::IpAddr;

pub trait HostProbe: Send + Sync {
    fn mac_address(&self) -> String;
    fn local_ip(&self) -> IpAddr;
}

/// Reads the MAC of the interface carrying the default route from sysfs,
/// and the local IP via the "connect a UDP socket, don't actually send
/// anything" trick (no traffic is emitted; UDP `connect` only binds the
/// local address the kernel would route through).
pub struct LinuxHostProbe;

impl HostProbe for LinuxHostProbe {
    fn mac_address(&self) -> String {
        default_route_iface()
            .and_then(|iface| std::fs::read_to_string(format!("/sys/class/net/{iface}/address")).ok())
            .map(|s| s.trim().to_ascii_uppercase())
            .unwrap_or_else(|| "00:00:00:00:00:00".to_string())
    }

    fn local_ip(&self) -> IpAddr {
        std::net::UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| {
                socket.connect("8.8.8.8:80")?;
                socket.local_addr()
            })
            .map(|addr| addr.ip())
            .unwrap_or_else(|_| IpAddr::from([127, 0, 0, 1]))
    }
}

fn default_route_iface() -> Option<String> {
    let route = std::fs::read_to_string("/proc/net/route").ok()?;
    route
        .lines()
        .skip(1)
        .find(|line| line.split_whitespace().nth(1) == Some("00000000"))
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

/// Used off-Linux and in tests: fixed, never touches the filesystem or network.
pub struct StubHostProbe {
    pub mac: String,
    pub ip: IpAddr,
}

impl HostProbe for StubHostProbe {
    fn mac_address(&self) -> String {
        self.mac.clone()
    }

    fn local_ip(&self) -> IpAddr {
        self.ip
    }
}
