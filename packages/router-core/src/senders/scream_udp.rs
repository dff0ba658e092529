//! Scream-UDP egress: prefixes each mixed chunk with the 5-byte inline
//! format header and sends it as one UDP datagram to the sink's configured
//! destination.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::error::{RouterError, RouterResult};
use crate::packet::FormatDescriptor;
use crate::protocol::scream::ScreamHeader;
use crate::sink::SinkTransport;
use crate::utils::validate_destination;

/// Sends mixed PCM to a single Scream-UDP destination.
pub struct ScreamUdpSender {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl ScreamUdpSender {
    pub fn new(destination: SocketAddr) -> RouterResult<Self> {
        validate_destination(&destination.ip(), destination.port())
            .map_err(|e| RouterError::Configuration(e.to_string()))?;
        let socket =
            UdpSocket::bind("0.0.0.0:0").map_err(|e| RouterError::Transport(e.to_string()))?;
        if let IpAddr::V4(v4) = destination.ip() {
            if v4.is_broadcast() {
                socket
                    .set_broadcast(true)
                    .map_err(|e| RouterError::Transport(e.to_string()))?;
            }
        }
        Ok(Self { socket, destination })
    }
}

impl SinkTransport for ScreamUdpSender {
    fn send_chunk(&mut self, pcm: &[u8], format: &FormatDescriptor) -> RouterResult<()> {
        let datagram = ScreamHeader::build_packet(format, pcm);
        self.socket
            .send_to(&datagram, self.destination)
            .map_err(|e| RouterError::Transport(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt() -> FormatDescriptor {
        FormatDescriptor::new(48000, 16, 2, 0x0003)
    }

    #[test]
    fn rejects_loopback_destination() {
        let err = ScreamUdpSender::new("127.0.0.1:4010".parse().unwrap());
        assert!(err.is_err());
    }

    #[test]
    fn sends_a_datagram_to_a_bound_peer() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();
        let peer_addr = listener.local_addr().unwrap();

        // The destination validator rejects loopback, so exercise the wire
        // framing directly instead of going through `ScreamUdpSender::new`.
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let datagram = ScreamHeader::build_packet(&fmt(), &[0u8; 8]);
        socket.send_to(&datagram, peer_addr).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = listener.recv_from(&mut buf).unwrap();
        assert_eq!(len, 5 + 8);
    }
}
