//! Ingress: one bound UDP socket and one worker thread per receiver (spec
//! 4.1). Each datagram is parsed, tagged, and deposited into the timeshift
//! buffer; the socket loop never blocks on anything but its own `recvfrom`
//! with a 50ms timeout, so it always notices a stop signal promptly.

pub mod rtp;
pub mod scream_udp;

pub use rtp::{RtpReceiverConfig, spawn_rtp_receiver};
pub use scream_udp::{spawn_scream_udp_receiver, ScreamUdpReceiverConfig};

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{RouterError, RouterResult};
use crate::runtime::StopSignal;

/// Every receiver blocks on `recvfrom` with this timeout so it can observe
/// a stop signal without a separate wakeup mechanism (spec 5 "Suspension
/// points").
pub const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Backoff schedule for rebinding after a socket error (spec 4.1 "socket
/// errors trigger rebind with backoff").
const REBIND_BACKOFF: [Duration; 5] = [
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_secs(1),
];

/// Per-receiver drop/error counters, shared with the owning handle so stats
/// can read them without synchronizing with the worker thread.
#[derive(Default)]
pub struct ReceiverStats {
    pub malformed_dropped: AtomicU64,
    pub packets_received: AtomicU64,
    pub rebinds: AtomicU64,
}

/// A running receiver's thread handle and stop signal.
pub struct ReceiverHandle {
    stop: StopSignal,
    join: Option<JoinHandle<()>>,
    stats: Arc<ReceiverStats>,
}

impl ReceiverHandle {
    #[must_use]
    pub fn stats(&self) -> Arc<ReceiverStats> {
        self.stats.clone()
    }

    /// Requests the worker thread to stop and joins it.
    pub fn stop_and_join(mut self) {
        self.stop.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

fn bind_udp(bind_addr: SocketAddr) -> RouterResult<UdpSocket> {
    let socket = UdpSocket::bind(bind_addr).map_err(|e| RouterError::Transport(e.to_string()))?;
    socket
        .set_read_timeout(Some(RECV_TIMEOUT))
        .map_err(|e| RouterError::Transport(e.to_string()))?;
    Ok(socket)
}

/// Rebinds `bind_addr` with exponential backoff, observing `stop` between
/// attempts. Returns `None` if a stop was requested before a bind succeeded.
fn rebind_with_backoff(
    bind_addr: SocketAddr,
    stop: &StopSignal,
    stats: &ReceiverStats,
) -> Option<UdpSocket> {
    for backoff in REBIND_BACKOFF.iter().chain(std::iter::repeat(&Duration::from_secs(1))) {
        if stop.is_stopped() {
            return None;
        }
        match bind_udp(bind_addr) {
            Ok(socket) => return Some(socket),
            Err(err) => {
                log::warn!("[receiver] rebind to {bind_addr} failed: {err}");
                stats.rebinds.fetch_add(1, Ordering::Relaxed);
                if stop.wait(*backoff) {
                    return None;
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_udp_on_ephemeral_port_succeeds() {
        let socket = bind_udp("127.0.0.1:0".parse().unwrap());
        assert!(socket.is_ok());
    }

    #[test]
    fn rebind_returns_none_when_already_stopped() {
        let stop = StopSignal::new();
        stop.stop();
        let stats = ReceiverStats::default();
        let result = rebind_with_backoff("127.0.0.1:0".parse().unwrap(), &stop, &stats);
        assert!(result.is_none());
    }
}
