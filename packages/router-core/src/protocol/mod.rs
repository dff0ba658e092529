//! Wire codecs for the protocols this router speaks: Scream-UDP's 5-byte
//! inline header and the RTP variant (including the 17-byte per-process
//! extension).

pub mod rtp;
pub mod scream;

pub use rtp::{RtpContinuity, RtpHeader, RTP_HEADER_LEN, RTP_EXTENDED_HEADER_LEN};
pub use scream::{ScreamHeader, SCREAM_HEADER_LEN};
