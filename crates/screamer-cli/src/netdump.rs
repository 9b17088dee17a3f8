//! Fire-and-forget UDP sink for raw TLP dumps.

use std::io;
use std::net::{ToSocketAddrs, UdpSocket};

use tracing::warn;

pub struct NetDump {
    socket: UdpSocket,
}

impl NetDump {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(addr)?;
        Ok(NetDump { socket })
    }

    /// Best-effort send; failures are logged, never propagated, so a dead
    /// sink can't stall the capture loop.
    pub fn dump(&self, bytes: &[u8]) {
        if let Err(err) = self.socket.send(bytes) {
            warn!(%err, "UDP dump failed");
        }
    }
}
