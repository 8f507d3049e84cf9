// Fire-and-forget JSON datagrams to a fixed host peer

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use serde::Serialize;
use serde_json::Value;

use crate::error::DriverError;

pub const MAX_DATAGRAM: usize = 512;

pub type Datagram = heapless::Vec<u8, MAX_DATAGRAM>;

/// `io::Write` over a datagram buffer. Writes that do not fit fail whole.
struct DatagramWriter<'a>(&'a mut Datagram);

impl io::Write for DatagramWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .extend_from_slice(buf)
            .map_err(|()| io::Error::new(ErrorKind::WriteZero, "datagram full"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Encode `doc` as one datagram. `None` if it does not fit.
pub fn encode<T: Serialize>(doc: &T) -> Option<Datagram> {
    let mut datagram = Datagram::new();
    match serde_json::to_writer(DatagramWriter(&mut datagram), doc) {
        Ok(()) => Some(datagram),
        Err(e) if e.is_io() => {
            log::error!("Telemetry message exceeds {} byte datagram", MAX_DATAGRAM);
            None
        }
        Err(e) => {
            log::error!("Telemetry encode failed: {}", e);
            None
        }
    }
}

pub struct UdpTelemetry {
    socket: UdpSocket,
    peer: SocketAddr,
    sent: u64,
    failed: u64,
}

impl UdpTelemetry {
    pub fn new(peer: SocketAddr) -> Result<Self, DriverError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| DriverError::new("udp bind", e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| DriverError::new("udp set_nonblocking", e.to_string()))?;
        log::info!("Telemetry to {}", peer);
        Ok(Self {
            socket,
            peer,
            sent: 0,
            failed: 0,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_port(&self) -> Option<u16> {
        self.socket.local_addr().ok().map(|a| a.port())
    }

    /// (sent, failed) counters since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.sent, self.failed)
    }

    /// Best effort: failures are logged and counted, never returned.
    pub fn send<T: Serialize>(&mut self, doc: &T) {
        let Some(datagram) = encode(doc) else {
            self.failed += 1;
            return;
        };
        match self.socket.send_to(&datagram, self.peer) {
            Ok(_) => self.sent += 1,
            Err(e) => {
                self.failed += 1;
                log::error!("Telemetry send to {} failed: {}", self.peer, e);
            }
        }
    }

    /// Next command datagram from the peer, if one is waiting.
    pub fn poll_command(&mut self) -> Option<Value> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if from.ip() != self.peer.ip() {
                        log::debug!("Ignoring datagram from {}", from);
                        continue;
                    }
                    match serde_json::from_slice(&buf[..len]) {
                        Ok(value) => return Some(value),
                        Err(e) => {
                            log::warn!("Malformed command datagram from {}: {}", from, e);
                            continue;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                Err(e) => {
                    log::warn!("Telemetry receive failed: {}", e);
                    return None;
                }
            }
        }
    }
}
