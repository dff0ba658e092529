//! General utilities shared across the router core.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::ErrorCode;

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen
/// in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds elapsed between two monotonic instants, saturating at zero
/// when `later` precedes `earlier` (clock skew between threads reading
/// `Instant::now()` at nearly the same moment).
#[must_use]
pub fn millis_between(earlier: Instant, later: Instant) -> u64 {
    later.saturating_duration_since(earlier).as_millis() as u64
}

/// Converts a frame count at a given sample rate to a `Duration`.
#[must_use]
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(frames as f64 / sample_rate as f64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Destination Address Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Error returned when a sink's destination address is not valid for a
/// network transport (Scream-UDP, RTP).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressValidationError {
    /// IPv6 destinations aren't supported by the Scream-UDP wire format.
    Ipv6NotSupported,
    /// Loopback address - almost always a misconfiguration for a LAN sink.
    Loopback,
    /// Unspecified address (0.0.0.0).
    Unspecified,
    /// Destination port 0 can't be bound or sent to.
    ZeroPort,
}

impl ErrorCode for AddressValidationError {
    fn code(&self) -> &'static str {
        "invalid_destination"
    }
}

impl std::fmt::Display for AddressValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::Ipv6NotSupported => "IPv6 destinations are not supported by Scream-UDP/RTP",
            Self::Loopback => "loopback destinations cannot receive a network sink",
            Self::Unspecified => "unspecified address (0.0.0.0) is not a valid destination",
            Self::ZeroPort => "destination port must be nonzero",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for AddressValidationError {}

/// Validates a network sink's destination address and port.
///
/// Broadcast and multicast are intentionally allowed: Scream senders
/// routinely fan out to a LAN broadcast address.
pub fn validate_destination(
    addr: &IpAddr,
    port: u16,
) -> Result<Ipv4Addr, AddressValidationError> {
    let ipv4 = match addr {
        IpAddr::V4(v4) => *v4,
        IpAddr::V6(_) => return Err(AddressValidationError::Ipv6NotSupported),
    };
    if ipv4.is_loopback() {
        return Err(AddressValidationError::Loopback);
    }
    if ipv4.is_unspecified() {
        return Err(AddressValidationError::Unspecified);
    }
    if port == 0 {
        return Err(AddressValidationError::ZeroPort);
    }
    Ok(ipv4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_destination_accepts_lan_address() {
        let addr: IpAddr = "192.168.1.50".parse().unwrap();
        assert!(validate_destination(&addr, 4010).is_ok());
    }

    #[test]
    fn validate_destination_accepts_broadcast() {
        let addr: IpAddr = "192.168.1.255".parse().unwrap();
        assert!(validate_destination(&addr, 4010).is_ok());
    }

    #[test]
    fn validate_destination_rejects_ipv6() {
        let addr: IpAddr = "::1".parse().unwrap();
        assert_eq!(
            validate_destination(&addr, 4010),
            Err(AddressValidationError::Ipv6NotSupported)
        );
    }

    #[test]
    fn validate_destination_rejects_loopback() {
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(
            validate_destination(&addr, 4010),
            Err(AddressValidationError::Loopback)
        );
    }

    #[test]
    fn validate_destination_rejects_zero_port() {
        let addr: IpAddr = "192.168.1.50".parse().unwrap();
        assert_eq!(
            validate_destination(&addr, 0),
            Err(AddressValidationError::ZeroPort)
        );
    }

    #[test]
    fn millis_between_is_zero_for_equal_instants() {
        let now = Instant::now();
        assert_eq!(millis_between(now, now), 0);
    }

    #[test]
    fn frames_to_duration_one_second_at_48k() {
        let d = frames_to_duration(48000, 48000);
        assert_eq!(d.as_millis(), 1000);
    }
}
