//! Egress transports: concrete [`sink::SinkTransport`](crate::sink::SinkTransport)
//! implementations for Scream-UDP and RTP network sinks, plus the trait seam
//! for a local playback device (spec 4.4/4.5, "Sink transports").

pub mod alsa;
pub mod rtp;
pub mod scream_udp;

pub use alsa::{AlsaPlaybackDevice, AlsaSender};
pub use rtp::RtpSender;
pub use scream_udp::ScreamUdpSender;

use crate::error::RouterResult;
use crate::packet::FormatDescriptor;
use crate::sink::SinkTransport;

/// Discards every chunk handed to it. Used for a WebRTC sink's primary
/// transport (that protocol's real distribution happens through its
/// side-tap fan-out, not `SinkTransport`) and for an `Alsa` sink configured
/// without a concrete [`AlsaPlaybackDevice`] wired in by an embedder.
pub struct NullSender;

impl SinkTransport for NullSender {
    fn send_chunk(&mut self, _pcm: &[u8], _format: &FormatDescriptor) -> RouterResult<()> {
        Ok(())
    }
}
