//! The data model shared by every layer: the source tag, the inline format
//! descriptor, and the tagged packet that receivers deposit into the
//! timeshift buffer.

use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque identifier distinguishing packet streams.
///
/// Typically a sender IP, `IP:port`, or a synthetic per-process identifier
/// derived from the RTP extended header's machine/process hash. Tags are
/// compared and hashed as plain strings; the engine never parses them.
pub type SourceTag = String;

/// Sample rate, bit depth, channel count, and channel-layout bitmap for a
/// PCM buffer. Mirrors the 5-byte Scream-UDP inline header 1:1 (see
/// `protocol::scream`) and is reused for RTP's identical inline descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub sample_rate: u32,
    pub bit_depth: u8,
    pub channels: u8,
    /// Low/high byte pair identifying which physical speakers the channels
    /// map to (front-left, front-right, LFE, ...). Opaque to everything but
    /// `dsp::channel_map`.
    pub channel_layout: u16,
}

impl FormatDescriptor {
    #[must_use]
    pub fn new(sample_rate: u32, bit_depth: u8, channels: u8, channel_layout: u16) -> Self {
        Self {
            sample_rate,
            bit_depth,
            channels,
            channel_layout,
        }
    }

    /// Bytes needed for one interleaved frame (all channels, one sample
    /// each).
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    /// Number of complete frames held in a buffer of `len` bytes. Any
    /// trailing partial frame is truncated, matching the payload-length
    /// invariant in the data model (payload length must equal
    /// `frames * channels * bit_depth/8`; a receiver that sees a remainder
    /// has already flagged the packet malformed).
    #[must_use]
    pub fn frame_count(&self, len: usize) -> usize {
        let fb = self.frame_bytes();
        if fb == 0 {
            0
        } else {
            len / fb
        }
    }
}

/// A received chunk of PCM, immutable once queued into the timeshift
/// buffer.
#[derive(Debug, Clone)]
pub struct TaggedAudioPacket {
    pub source_tag: SourceTag,
    /// Monotonic receive time, used for ordering and for the timeshift
    /// buffer's age bookkeeping. Never serialized - it's only meaningful
    /// within this process's `Instant` epoch.
    pub received_at: Instant,
    pub payload: Bytes,
    pub format: FormatDescriptor,
    /// RTP timestamp, when this packet originated from an RTP receiver.
    pub rtp_timestamp: Option<u32>,
    /// Effective playback-rate multiplier in effect when this packet was
    /// read out of the buffer by a cursor; `1.0` until a cursor's rate
    /// control loop has touched it. Stored on the packet (rather than
    /// looked up separately) so an exported window is self-describing.
    pub playback_rate: f32,
}

impl TaggedAudioPacket {
    #[must_use]
    pub fn new(source_tag: SourceTag, payload: Bytes, format: FormatDescriptor) -> Self {
        Self {
            source_tag,
            received_at: Instant::now(),
            payload,
            format,
            rtp_timestamp: None,
            playback_rate: 1.0,
        }
    }

    /// Number of complete frames carried by this packet.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.format.frame_count(self.payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_stereo_16bit() {
        let fmt = FormatDescriptor::new(48000, 16, 2, 0x0003);
        assert_eq!(fmt.frame_bytes(), 4);
    }

    #[test]
    fn frame_count_matches_payload_invariant() {
        let fmt = FormatDescriptor::new(48000, 16, 2, 0x0003);
        // 1152 frames * 2 channels * 2 bytes = 4608 bytes, the default
        // Scream-UDP datagram payload.
        assert_eq!(fmt.frame_count(4608), 1152);
    }

    #[test]
    fn frame_count_truncates_partial_trailing_frame() {
        let fmt = FormatDescriptor::new(48000, 16, 2, 0x0003);
        assert_eq!(fmt.frame_count(4609), 1152);
    }

    #[test]
    fn packet_frame_count_delegates_to_format() {
        let fmt = FormatDescriptor::new(44100, 16, 1, 0x0001);
        let pkt = TaggedAudioPacket::new("10.0.0.5".into(), Bytes::from(vec![0u8; 200]), fmt);
        assert_eq!(pkt.frame_count(), 100);
    }
}
