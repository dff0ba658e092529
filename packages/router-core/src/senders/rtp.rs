//! RTP egress: wraps each mixed chunk in a standard 12-byte RTP header with
//! a monotonically increasing sequence number and a timestamp advanced by
//! the frame count, followed by the same 5-byte format descriptor and PCM.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::error::{RouterError, RouterResult};
use crate::packet::FormatDescriptor;
use crate::protocol::rtp::RtpHeader;
use crate::protocol::scream::ScreamHeader;
use crate::sink::SinkTransport;
use crate::utils::validate_destination;

const RTP_PAYLOAD_TYPE_DYNAMIC: u8 = 97;

/// Sends mixed PCM as RTP to a single destination.
pub struct RtpSender {
    socket: UdpSocket,
    destination: SocketAddr,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpSender {
    pub fn new(destination: SocketAddr, ssrc: u32) -> RouterResult<Self> {
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
        Ok(Self {
            socket,
            destination,
            ssrc,
            sequence: 0,
            timestamp: 0,
        })
    }
}

impl SinkTransport for RtpSender {
    fn send_chunk(&mut self, pcm: &[u8], format: &FormatDescriptor) -> RouterResult<()> {
        let header = RtpHeader {
            marker: self.sequence == 0,
            payload_type: RTP_PAYLOAD_TYPE_DYNAMIC,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
            origination: None,
        };

        let mut datagram = header.encode();
        datagram.extend_from_slice(&ScreamHeader::encode(format));
        datagram.extend_from_slice(pcm);

        self.socket
            .send_to(&datagram, self.destination)
            .map_err(|e| RouterError::Transport(e.to_string()))?;

        self.sequence = self.sequence.wrapping_add(1);
        let frames = format.frame_count(pcm.len()) as u32;
        self.timestamp = self.timestamp.wrapping_add(frames);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as StdUdpSocket;

    fn fmt() -> FormatDescriptor {
        FormatDescriptor::new(48000, 16, 2, 0x0003)
    }

    #[test]
    fn rejects_loopback_destination() {
        assert!(RtpSender::new("127.0.0.1:5004".parse().unwrap(), 1).is_err());
    }

    #[test]
    fn sequence_and_timestamp_advance_per_chunk() {
        let listener = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(std::time::Duration::from_millis(200)))
            .unwrap();
        let peer = listener.local_addr().unwrap();

        // Destination validation forbids loopback; build the sender's guts
        // directly to exercise sequence/timestamp bookkeeping.
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let mut sender = RtpSender {
            socket,
            destination: peer,
            ssrc: 42,
            sequence: 0,
            timestamp: 0,
        };

        let pcm = vec![0u8; 1152 * 4];
        sender.send_chunk(&pcm, &fmt()).unwrap();
        sender.send_chunk(&pcm, &fmt()).unwrap();

        assert_eq!(sender.sequence, 2);
        assert_eq!(sender.timestamp, 2 * 1152);
    }
}
