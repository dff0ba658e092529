//! RTP ingress (spec 4.1, 6 "RTP wire format"). Tracks per-tag sequence
//! continuity so a sender restart resets playback state instead of being
//! read as an enormous packet-loss gap.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;

use crate::events::{DiscoveryEvent, EventEmitter};
use crate::packet::{SourceTag, TaggedAudioPacket};
use crate::protocol::rtp::{ContinuityOutcome, RtpContinuity, RtpHeader};
use crate::protocol::scream::ScreamHeader;
use crate::runtime::StopSignal;
use crate::timeshift::TimeshiftManager;
use crate::utils::now_millis;

use super::{bind_udp, rebind_with_backoff, ReceiverHandle, ReceiverStats};

pub const RECEIVER_KIND: &str = "rtp";

/// Default for [`RtpReceiverConfig::rtp_session_reset_threshold_seconds`]
/// when a caller doesn't have a stronger opinion.
pub const DEFAULT_RTP_SESSION_RESET_THRESHOLD_SECONDS: f64 = 2.0;

/// Configuration for one RTP listening socket.
#[derive(Debug, Clone, Copy)]
pub struct RtpReceiverConfig {
    pub bind_addr: SocketAddr,
    /// Whether senders on this socket use the 17-byte extended header with
    /// the origination-id extension. Fixed per listener, since the two
    /// variants aren't self-describing.
    pub extended_header: bool,
    /// How long a tag's datagram stream may go silent before the next
    /// packet is treated as a new RTP session rather than a continuation
    /// (spec 4.1 "detect silence intervals beyond
    /// `rtp_session_reset_threshold_seconds` and reset continuity").
    pub rtp_session_reset_threshold_seconds: f64,
}

/// Spawns a worker thread that owns the bound socket for the lifetime of the
/// returned handle.
pub fn spawn_rtp_receiver(
    config: RtpReceiverConfig,
    manager: TimeshiftManager,
    emitter: Arc<dyn EventEmitter>,
) -> crate::error::RouterResult<ReceiverHandle> {
    let socket = bind_udp(config.bind_addr)?;
    let stop = StopSignal::new();
    let stats = Arc::new(ReceiverStats::default());

    let worker_stop = stop.clone();
    let worker_stats = stats.clone();
    let join = std::thread::Builder::new()
        .name(format!("rtp-recv-{}", config.bind_addr.port()))
        .spawn(move || run_loop(socket, config, manager, emitter, worker_stop, worker_stats))
        .map_err(|e| crate::error::RouterError::Fatal(e.to_string()))?;

    Ok(ReceiverHandle {
        stop,
        join: Some(join),
        stats,
    })
}

fn run_loop(
    mut socket: std::net::UdpSocket,
    config: RtpReceiverConfig,
    manager: TimeshiftManager,
    emitter: Arc<dyn EventEmitter>,
    stop: StopSignal,
    stats: Arc<ReceiverStats>,
) {
    let continuity: DashMap<SourceTag, RtpContinuity> = DashMap::new();
    let mut buf = [0u8; 65_536];
    while !stop.is_stopped() {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                stats.packets_received.fetch_add(1, Ordering::Relaxed);
                handle_datagram(&buf[..len], peer, config, &manager, &emitter, &stats, &continuity);
            }
            Err(err) if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => {
                log::warn!("[rtp] recv error on {}: {err}", config.bind_addr);
                match rebind_with_backoff(config.bind_addr, &stop, &stats) {
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
    config: RtpReceiverConfig,
    manager: &TimeshiftManager,
    emitter: &Arc<dyn EventEmitter>,
    stats: &ReceiverStats,
    continuity: &DashMap<SourceTag, RtpContinuity>,
) {
    let (header, rest) = match RtpHeader::parse(datagram, config.extended_header) {
        Ok(parsed) => parsed,
        Err(err) => {
            stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("[rtp] dropping malformed datagram from {peer}: {err}");
            return;
        }
    };

    let (scream_header, pcm) = match ScreamHeader::parse_packet(rest) {
        Ok(parsed) => parsed,
        Err(err) => {
            stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("[rtp] dropping malformed datagram from {peer}: {err}");
            return;
        }
    };

    let tag = match header.origination {
        Some(origination) => format!("{}:{}", peer.ip(), origination.tag_suffix()),
        None => peer.ip().to_string(),
    };

    let received_at = Instant::now();
    let silence_reset_after =
        Duration::from_secs_f64(config.rtp_session_reset_threshold_seconds.max(0.0));

    let mut tracker = continuity.entry(tag.clone()).or_default();
    match tracker.observe(header.sequence, header.timestamp, received_at, silence_reset_after) {
        ContinuityOutcome::SessionReset => {
            log::info!("[rtp] session reset detected for {tag}, resetting continuity tracker");
            *tracker = RtpContinuity::new();
            tracker.observe(header.sequence, header.timestamp, received_at, silence_reset_after);
        }
        ContinuityOutcome::Gap { lost } => {
            log::debug!("[rtp] {lost} packet(s) lost for {tag}");
        }
        ContinuityOutcome::Initial | ContinuityOutcome::InOrder => {}
    }
    drop(tracker);

    let mut packet = TaggedAudioPacket::new(tag.clone(), Bytes::copy_from_slice(pcm), scream_header.format);
    packet.rtp_timestamp = Some(header.timestamp);

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

    fn config() -> RtpReceiverConfig {
        RtpReceiverConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            extended_header: false,
            rtp_session_reset_threshold_seconds: DEFAULT_RTP_SESSION_RESET_THRESHOLD_SECONDS,
        }
    }

    fn build_datagram(sequence: u16, timestamp: u32, pcm: &[u8]) -> Vec<u8> {
        let header = RtpHeader {
            marker: false,
            payload_type: 97,
            sequence,
            timestamp,
            ssrc: 0x1234,
            origination: None,
        };
        let mut bytes = header.encode();
        bytes.extend_from_slice(&ScreamHeader::encode(&fmt()));
        bytes.extend_from_slice(pcm);
        bytes
    }

    #[test]
    fn malformed_datagram_is_dropped_and_counted() {
        let manager = TimeshiftManager::new(TimeshiftConfig::default(), 1_000);
        let emitter: Arc<dyn EventEmitter> = Arc::new(NoopEventEmitter);
        let stats = ReceiverStats::default();
        let continuity = DashMap::new();
        let peer: SocketAddr = "10.0.0.5:5004".parse().unwrap();

        handle_datagram(&[0u8; 4], peer, config(), &manager, &emitter, &stats, &continuity);

        assert_eq!(stats.malformed_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn well_formed_datagram_deposits_a_packet() {
        let manager = TimeshiftManager::new(TimeshiftConfig::default(), 1_000);
        let emitter: Arc<dyn EventEmitter> = Arc::new(NoopEventEmitter);
        let stats = ReceiverStats::default();
        let continuity = DashMap::new();
        let peer: SocketAddr = "10.0.0.9:5004".parse().unwrap();

        let datagram = build_datagram(1, 1000, &vec![0u8; 1152 * 4]);
        handle_datagram(&datagram, peer, config(), &manager, &emitter, &stats, &continuity);

        assert_eq!(manager.known_tags(), vec!["10.0.0.9".to_string()]);
    }

    #[test]
    fn session_reset_replaces_the_continuity_tracker() {
        let manager = TimeshiftManager::new(TimeshiftConfig::default(), 1_000);
        let emitter: Arc<dyn EventEmitter> = Arc::new(NoopEventEmitter);
        let stats = ReceiverStats::default();
        let continuity = DashMap::new();
        let peer: SocketAddr = "10.0.0.11:5004".parse().unwrap();

        let pcm = vec![0u8; 1152 * 4];
        handle_datagram(&build_datagram(5000, 1_000_000, &pcm), peer, config(), &manager, &emitter, &stats, &continuity);
        handle_datagram(&build_datagram(10, 0, &pcm), peer, config(), &manager, &emitter, &stats, &continuity);

        let tag = "10.0.0.11".to_string();
        let tracker = continuity.get(&tag).unwrap();
        assert_eq!(tracker.last_timestamp(), 0);
    }

    #[test]
    fn extended_silence_resets_continuity_even_with_in_order_sequence() {
        let manager = TimeshiftManager::new(TimeshiftConfig::default(), 1_000);
        let emitter: Arc<dyn EventEmitter> = Arc::new(NoopEventEmitter);
        let stats = ReceiverStats::default();
        let continuity = DashMap::new();
        let peer: SocketAddr = "10.0.0.12:5004".parse().unwrap();
        let mut cfg = config();
        cfg.rtp_session_reset_threshold_seconds = 0.02;

        let pcm = vec![0u8; 1152 * 4];
        handle_datagram(&build_datagram(10, 1_000, &pcm), peer, cfg, &manager, &emitter, &stats, &continuity);
        std::thread::sleep(Duration::from_millis(50));
        handle_datagram(&build_datagram(11, 2_000, &pcm), peer, cfg, &manager, &emitter, &stats, &continuity);

        let tag = "10.0.0.12".to_string();
        let tracker = continuity.get(&tag).unwrap();
        // In-order sequence numbers alone would never produce a
        // `SessionReset`; the tracker only re-anchors because the gap since
        // the previous datagram exceeded `rtp_session_reset_threshold_seconds`.
        // This exercises the plumbing end-to-end - `protocol::rtp`'s own
        // tests cover the reset/no-reset decision itself.
        assert_eq!(tracker.last_timestamp(), 2_000);
    }
}
