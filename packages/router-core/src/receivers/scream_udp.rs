//! Scream-UDP ingress (spec 4.1, 6 "Scream-UDP wire format"). One UDP socket
//! per configured listen port; the sender's address becomes the source tag.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::events::{DiscoveryEvent, EventEmitter};
use crate::packet::TaggedAudioPacket;
use crate::protocol::scream::ScreamHeader;
use crate::runtime::StopSignal;
use crate::timeshift::TimeshiftManager;
use crate::utils::now_millis;

use super::{bind_udp, rebind_with_backoff, ReceiverHandle, ReceiverStats};

pub const RECEIVER_KIND: &str = "scream-udp";

/// Configuration for one Scream-UDP listening socket.
#[derive(Debug, Clone, Copy)]
pub struct ScreamUdpReceiverConfig {
    pub bind_addr: SocketAddr,
}

/// Spawns a worker thread that owns the bound socket for the lifetime of the
/// returned handle.
pub fn spawn_scream_udp_receiver(
    config: ScreamUdpReceiverConfig,
    manager: TimeshiftManager,
    emitter: Arc<dyn EventEmitter>,
) -> crate::error::RouterResult<ReceiverHandle> {
    let socket = bind_udp(config.bind_addr)?;
    let stop = StopSignal::new();
    let stats = Arc::new(ReceiverStats::default());

    let worker_stop = stop.clone();
    let worker_stats = stats.clone();
    let join = std::thread::Builder::new()
        .name(format!("scream-udp-recv-{}", config.bind_addr.port()))
        .spawn(move || run_loop(socket, config.bind_addr, manager, emitter, worker_stop, worker_stats))
        .map_err(|e| crate::error::RouterError::Fatal(e.to_string()))?;

    Ok(ReceiverHandle {
        stop,
        join: Some(join),
        stats,
    })
}

fn run_loop(
    mut socket: std::net::UdpSocket,
    bind_addr: SocketAddr,
    manager: TimeshiftManager,
    emitter: Arc<dyn EventEmitter>,
    stop: StopSignal,
    stats: Arc<ReceiverStats>,
) {
    let mut buf = [0u8; 65_536];
    while !stop.is_stopped() {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                stats.packets_received.fetch_add(1, Ordering::Relaxed);
                handle_datagram(&buf[..len], peer, &manager, &emitter, &stats);
            }
            Err(err) if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => {
                log::warn!("[scream-udp] recv error on {bind_addr}: {err}");
                match rebind_with_backoff(bind_addr, &stop, &stats) {
                    Some(rebound) => socket = rebound,
                    None => return,
                }
            }
        }
    }
}

fn handle_datagram(
    datagram: &[u8],
    peer: SocketAddr,
    manager: &TimeshiftManager,
    emitter: &Arc<dyn EventEmitter>,
    stats: &ReceiverStats,
) {
    let (header, pcm) = match ScreamHeader::parse_packet(datagram) {
        Ok(parsed) => parsed,
        Err(err) => {
            stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("[scream-udp] dropping malformed datagram from {peer}: {err}");
            return;
        }
    };

    let tag = peer.ip().to_string();
    let packet = TaggedAudioPacket::new(tag.clone(), Bytes::copy_from_slice(pcm), header.format);
    let first_seen = manager.add_packet(packet);
    if first_seen {
        emitter.emit_discovery(DiscoveryEvent::TagSeen {
            tag,
            receiver_kind: RECEIVER_KIND,
            timestamp: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::timeshift::{TimeshiftConfig, TimeshiftManager};

    fn fmt() -> crate::packet::FormatDescriptor {
        crate::packet::FormatDescriptor::new(48000, 16, 2, 0x0003)
    }

    #[test]
    fn malformed_datagram_is_dropped_and_counted() {
        let manager = TimeshiftManager::new(TimeshiftConfig::default(), 1_000);
        let emitter: Arc<dyn EventEmitter> = Arc::new(NoopEventEmitter);
        let stats = ReceiverStats::default();
        let peer: SocketAddr = "10.0.0.5:4010".parse().unwrap();

        handle_datagram(&[0u8; 2], peer, &manager, &emitter, &stats);

        assert_eq!(stats.malformed_dropped.load(Ordering::Relaxed), 1);
        assert!(manager.known_tags().is_empty());
    }

    #[test]
    fn well_formed_datagram_deposits_a_packet_and_tags_the_sender() {
        let manager = TimeshiftManager::new(TimeshiftConfig::default(), 1_000);
        let emitter: Arc<dyn EventEmitter> = Arc::new(NoopEventEmitter);
        let stats = ReceiverStats::default();
        let peer: SocketAddr = "10.0.0.7:4010".parse().unwrap();

        let pcm = vec![0u8; 1152 * 4];
        let datagram = ScreamHeader::build_packet(&fmt(), &pcm);

        handle_datagram(&datagram, peer, &manager, &emitter, &stats);

        assert_eq!(manager.known_tags(), vec!["10.0.0.7".to_string()]);
    }
}
