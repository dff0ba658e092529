//! RTP ingress/egress variant: a standard 12-byte RTP header, optionally
//! extended to 17 bytes with a per-process origination identifier, followed
//! by the same 5-byte format descriptor Scream-UDP uses and interleaved PCM.
//!
//! The origination identifier (4-byte machine hash + 1-byte process hash)
//! lets several processes on the same host share one SSRC space without
//! colliding on a single source tag; receivers append it as a suffix to the
//! tag derived from the sender's address.

use std::time::{Duration, Instant};

use crate::protocol::scream::SCREAM_HEADER_LEN;

/// Length of the standard RTP fixed header.
pub const RTP_HEADER_LEN: usize = 12;

/// Length of the origination-id extension appended after the fixed header
/// in the extended variant.
pub const ORIGINATION_ID_LEN: usize = 5;

/// Length of the RTP header when the origination-id extension is present.
pub const RTP_EXTENDED_HEADER_LEN: usize = RTP_HEADER_LEN + ORIGINATION_ID_LEN;

/// RTP version this router speaks. Anything else is rejected.
const RTP_VERSION: u8 = 2;

/// Per-process origination identifier carried by the extended header
/// variant; becomes the suffix of the derived source tag (e.g.
/// `10.0.0.5:a1b2c3d4-07`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginationId {
    pub machine_hash: u32,
    pub process_hash: u8,
}

impl OriginationId {
    /// Formats as the hyphenated hex suffix appended to a source tag.
    #[must_use]
    pub fn tag_suffix(&self) -> String {
        format!("{:08x}-{:02x}", self.machine_hash, self.process_hash)
    }
}

/// A parsed RTP header, with PCM framing metadata from the non-RTP fields
/// still to be parsed by the caller via `protocol::scream::ScreamHeader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub origination: Option<OriginationId>,
}

/// Error returned when a datagram doesn't parse as a valid RTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RtpParseError {
    #[error("datagram shorter than the 12-byte RTP header")]
    TooShort,
    #[error("unsupported RTP version")]
    UnsupportedVersion,
    #[error("datagram missing the 17-byte extended header's origination id")]
    TruncatedExtension,
    #[error("datagram missing the 5-byte format descriptor that follows the RTP header")]
    MissingFormatDescriptor,
}

impl RtpHeader {
    /// Parses the RTP header from the start of a datagram.
    ///
    /// `extended` selects whether the 5-byte origination-id extension is
    /// expected; the caller determines this per listener configuration,
    /// since the two variants aren't self-describing from the RTP header
    /// alone.
    pub fn parse(bytes: &[u8], extended: bool) -> Result<(Self, &[u8]), RtpParseError> {
        if bytes.len() < RTP_HEADER_LEN {
            return Err(RtpParseError::TooShort);
        }
        let version = bytes[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpParseError::UnsupportedVersion);
        }
        let marker = bytes[1] & 0x80 != 0;
        let payload_type = bytes[1] & 0x7f;
        let sequence = u16::from_be_bytes([bytes[2], bytes[3]]);
        let timestamp = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let ssrc = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        let mut rest = &bytes[RTP_HEADER_LEN..];
        let origination = if extended {
            if rest.len() < ORIGINATION_ID_LEN {
                return Err(RtpParseError::TruncatedExtension);
            }
            let machine_hash = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
            let process_hash = rest[4];
            rest = &rest[ORIGINATION_ID_LEN..];
            Some(OriginationId {
                machine_hash,
                process_hash,
            })
        } else {
            None
        };

        if rest.len() < SCREAM_HEADER_LEN {
            return Err(RtpParseError::MissingFormatDescriptor);
        }

        Ok((
            Self {
                marker,
                payload_type,
                sequence,
                timestamp,
                ssrc,
                origination,
            },
            rest,
        ))
    }

    /// Length in bytes of this header as it would be encoded, including the
    /// origination-id extension when present.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        if self.origination.is_some() {
            RTP_EXTENDED_HEADER_LEN
        } else {
            RTP_HEADER_LEN
        }
    }

    /// Encodes the RTP header (without the trailing format descriptor or
    /// PCM, which callers append separately via `ScreamHeader::encode`).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push((RTP_VERSION << 6) & 0xc0);
        out.push((self.marker as u8) << 7 | (self.payload_type & 0x7f));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        if let Some(origination) = self.origination {
            out.extend_from_slice(&origination.machine_hash.to_be_bytes());
            out.push(origination.process_hash);
        }
        out
    }
}

/// Tracks per-source RTP sequence/timestamp continuity so the receiver can
/// tell an ordinary gap (packet loss) from a session reset (sender
/// restarted and rewound its counters, or went silent long enough that the
/// next datagram should be treated as a new session rather than a
/// continuation).
///
/// A session reset is declared either when the sequence number moves
/// backwards by more than `RESET_SEQUENCE_SLACK` (which a plain wraparound
/// or a handful of reordered packets can't produce), or when the gap since
/// the previous datagram exceeds the configured silence threshold (spec
/// 4.1 "detect silence intervals beyond `rtp_session_reset_threshold_seconds`
/// and reset continuity"; spec 7 lists "extended silence" alongside an RTP
/// sequence break as a Protocol-reset trigger).
#[derive(Debug, Clone, Copy)]
pub struct RtpContinuity {
    last_sequence: u16,
    last_timestamp: u32,
    last_received: Option<Instant>,
    initialized: bool,
}

/// How far backwards a sequence number may jump before it's treated as
/// reordering rather than a session reset.
const RESET_SEQUENCE_SLACK: u16 = 1024;

/// Outcome of feeding one packet's header into an `RtpContinuity` tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuityOutcome {
    /// First packet seen for this tracker.
    Initial,
    /// Sequence advanced as expected (accounting for wraparound); no gap.
    InOrder,
    /// Sequence skipped ahead - packets were lost in transit.
    Gap { lost: u16 },
    /// Sequence moved backwards far enough to indicate the sender restarted.
    SessionReset,
}

impl RtpContinuity {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_sequence: 0,
            last_timestamp: 0,
            last_received: None,
            initialized: false,
        }
    }

    /// Feeds one packet's header in, returning what changed relative to the
    /// previous packet and updating internal state.
    ///
    /// `received_at` is this packet's receive time and `silence_reset_after`
    /// is the configured `rtp_session_reset_threshold_seconds`: if the gap
    /// since the previous packet for this tag is at least that long, the
    /// tracker re-anchors on this packet exactly as it would for a sequence
    /// number that jumped backwards (a `SessionReset`), rather than reading
    /// the resumed stream as one enormous loss gap.
    pub fn observe(
        &mut self,
        sequence: u16,
        timestamp: u32,
        received_at: Instant,
        silence_reset_after: Duration,
    ) -> ContinuityOutcome {
        if !self.initialized {
            self.last_sequence = sequence;
            self.last_timestamp = timestamp;
            self.last_received = Some(received_at);
            self.initialized = true;
            return ContinuityOutcome::Initial;
        }

        let silent_too_long = self
            .last_received
            .is_some_and(|prev| received_at.saturating_duration_since(prev) >= silence_reset_after);

        let forward_delta = sequence.wrapping_sub(self.last_sequence);
        let backward_delta = self.last_sequence.wrapping_sub(sequence);

        let outcome = if silent_too_long {
            ContinuityOutcome::SessionReset
        } else if backward_delta != 0 && backward_delta < RESET_SEQUENCE_SLACK {
            ContinuityOutcome::SessionReset
        } else if forward_delta == 1 {
            ContinuityOutcome::InOrder
        } else if forward_delta == 0 {
            ContinuityOutcome::InOrder
        } else {
            ContinuityOutcome::Gap {
                lost: forward_delta - 1,
            }
        };

        self.last_sequence = sequence;
        self.last_timestamp = timestamp;
        self.last_received = Some(received_at);
        outcome
    }

    #[must_use]
    pub fn last_timestamp(&self) -> u32 {
        self.last_timestamp
    }
}

impl Default for RtpContinuity {
    fn default() -> Self {
        Self::new()
    }
}
