//! Scream-UDP wire format: a 5-byte inline format header followed by
//! interleaved PCM.
//!
//! ```text
//! byte 0: sample-rate index (high bit = 44.1kHz family, low 7 bits = multiplier)
//! byte 1: bit depth (16 / 24 / 32)
//! byte 2: channel count (1..8)
//! byte 3: channel-layout low byte
//! byte 4: channel-layout high byte
//! ```

use crate::packet::FormatDescriptor;

/// Length of the inline format header in bytes.
pub const SCREAM_HEADER_LEN: usize = 5;

/// Default payload size, in frames, of one Scream-UDP datagram.
pub const DEFAULT_FRAMES_PER_DATAGRAM: usize = 1152;

/// A parsed Scream-UDP inline header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreamHeader {
    pub format: FormatDescriptor,
}

/// Error returned when a datagram is too short or encodes values the
/// wire format can't carry. The receiver drops and counts on this; it is
/// not a `RouterError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScreamParseError {
    #[error("datagram shorter than the 5-byte inline header")]
    TooShort,
    #[error("sample-rate multiplier of zero is not valid")]
    ZeroMultiplier,
    #[error("payload length is not a whole number of frames")]
    TruncatedFrame,
}

impl ScreamHeader {
    /// Parses the 5-byte inline header from the start of a datagram.
    ///
    /// Does not validate that the remaining payload is a whole number of
    /// frames for that format - callers that need the strict payload-length
    /// invariant should call [`parse_packet`].
    pub fn parse(bytes: &[u8]) -> Result<Self, ScreamParseError> {
        if bytes.len() < SCREAM_HEADER_LEN {
            return Err(ScreamParseError::TooShort);
        }
        let rate_index = bytes[0];
        let base = if rate_index & 0x80 != 0 { 44_100 } else { 48_000 };
        let multiplier = (rate_index & 0x7f) as u32;
        if multiplier == 0 {
            return Err(ScreamParseError::ZeroMultiplier);
        }
        let sample_rate = base * multiplier;
        let bit_depth = bytes[1];
        let channels = bytes[2];
        let channel_layout = u16::from_le_bytes([bytes[3], bytes[4]]);

        Ok(Self {
            format: FormatDescriptor::new(sample_rate, bit_depth, channels, channel_layout),
        })
    }

    /// Parses the header and returns it along with the PCM payload slice,
    /// rejecting a payload that isn't a whole number of frames.
    pub fn parse_packet(bytes: &[u8]) -> Result<(Self, &[u8]), ScreamParseError> {
        let header = Self::parse(bytes)?;
        let payload = &bytes[SCREAM_HEADER_LEN..];
        let frame_bytes = header.format.frame_bytes();
        if frame_bytes == 0 || payload.len() % frame_bytes != 0 {
            return Err(ScreamParseError::TruncatedFrame);
        }
        Ok((header, payload))
    }

    /// Encodes the 5-byte inline header for the given format.
    ///
    /// The sample rate must be an integer multiple of 44100 or 48000 up to
    /// a multiplier of 127; anything else is rounded down to the nearest
    /// valid multiplier of the 48kHz family, matching how the Scream
    /// protocol represents only discrete rate families.
    #[must_use]
    pub fn encode(format: &FormatDescriptor) -> [u8; SCREAM_HEADER_LEN] {
        let (family_bit, base) = if format.sample_rate % 44_100 == 0 {
            (0x80u8, 44_100u32)
        } else {
            (0x00u8, 48_000u32)
        };
        let multiplier = (format.sample_rate / base).clamp(1, 0x7f) as u8;
        let rate_index = family_bit | multiplier;
        let layout = format.channel_layout.to_le_bytes();
        [
            rate_index,
            format.bit_depth,
            format.channels,
            layout[0],
            layout[1],
        ]
    }

    /// Builds a complete datagram: header followed by `pcm`.
    #[must_use]
    pub fn build_packet(format: &FormatDescriptor, pcm: &[u8]) -> Vec<u8> {
        let header = Self::encode(format);
        let mut out = Vec::with_capacity(SCREAM_HEADER_LEN + pcm.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(pcm);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_48k_stereo_16bit() {
        let fmt = FormatDescriptor::new(48000, 16, 2, 0x0003);
        let header = ScreamHeader::encode(&fmt);
        let parsed = ScreamHeader::parse(&header).unwrap();
        assert_eq!(parsed.format, fmt);
    }

    #[test]
    fn round_trips_44k1_family_x2() {
        let fmt = FormatDescriptor::new(88_200, 24, 2, 0x0003);
        let header = ScreamHeader::encode(&fmt);
        let parsed = ScreamHeader::parse(&header).unwrap();
        assert_eq!(parsed.format.sample_rate, 88_200);
        assert_eq!(parsed.format.bit_depth, 24);
    }

    #[test]
    fn rejects_short_datagram() {
        assert_eq!(ScreamHeader::parse(&[1, 16, 2, 3]), Err(ScreamParseError::TooShort));
    }

    #[test]
    fn rejects_zero_multiplier() {
        let bytes = [0x00, 16, 2, 0, 0];
        assert_eq!(ScreamHeader::parse(&bytes), Err(ScreamParseError::ZeroMultiplier));
    }

    #[test]
    fn parse_packet_rejects_truncated_frame() {
        let fmt = FormatDescriptor::new(48000, 16, 2, 0x0003);
        let mut datagram = ScreamHeader::build_packet(&fmt, &[0u8; 4]);
        datagram.push(0xAA); // odd trailing byte, not a whole stereo-16 frame
        assert_eq!(
            ScreamHeader::parse_packet(&datagram).unwrap_err(),
            ScreamParseError::TruncatedFrame
        );
    }

    #[test]
    fn build_and_parse_packet_roundtrip() {
        let fmt = FormatDescriptor::new(48000, 16, 2, 0x0003);
        let pcm = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let datagram = ScreamHeader::build_packet(&fmt, &pcm);
        let (header, payload) = ScreamHeader::parse_packet(&datagram).unwrap();
        assert_eq!(header.format, fmt);
        assert_eq!(payload, &pcm[..]);
    }
}
