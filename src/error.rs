//! Crate error type.
//!
//! All foreground APIs validate their arguments at the boundary and report
//! bad input through [`Error`]. Decode failures are not errors: an
//! unrecognized or corrupt packet classifies as
//! [`PacketType::Invalid`](crate::packet::PacketType::Invalid) and a corrupt
//! RailCom channel parses empty. Nothing on the interrupt path returns (or
//! panics with) an error.

use core::fmt;

/// Argument-validation errors returned by the foreground command API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Error {
    /// Locomotive address outside 1..=10239.
    InvalidAddress,
    /// Speed outside -127..=127.
    InvalidSpeed,
    /// Function number outside the configured function cap.
    InvalidFunction,
    /// CV number outside 1..=1024.
    InvalidCvNum,
    /// CV bit index outside 0..=7.
    InvalidBit,
    /// No live throttle behind the given id or address.
    NoSuchThrottle,
    /// Operation not valid in the current mode (e.g. starting a service
    /// sequence while another is still in progress).
    BadMode,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::InvalidAddress => "address out of range",
            Error::InvalidSpeed => "speed out of range",
            Error::InvalidFunction => "function number out of range",
            Error::InvalidCvNum => "cv number out of range",
            Error::InvalidBit => "bit index out of range",
            Error::NoSuchThrottle => "no such throttle",
            Error::BadMode => "operation not valid in current mode",
        };
        f.write_str(s)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
