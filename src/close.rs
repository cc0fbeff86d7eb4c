//! # Close codes
//!
//! Status codes carried by Close frames, as defined in
//! [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
//!
//! Codes are checked on the wire: a peer sending a code outside `1000..=4999`, or one in the
//! ranges `1004..=1006` and `1012..=2999`, fails the connection with [`CloseCode::Protocol`].

/// A WebSocket close code.
///
/// Indicates why an endpoint is closing the WebSocket connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Normal closure: the purpose of the connection has been fulfilled.
    Normal,
    /// The endpoint is going away, such as a server going down.
    Away,
    /// The endpoint is terminating the connection due to a protocol error.
    Protocol,
    /// The endpoint received a type of data it cannot accept.
    Unsupported,
    /// No status code was present in the close frame. Never sent on the wire.
    Status,
    /// The connection was dropped without a close frame. Never sent on the wire.
    Abnormal,
    /// The endpoint received data inconsistent with the message type, such as
    /// non-UTF-8 data within a text message.
    Invalid,
    /// The endpoint received a message that violates its policy.
    Policy,
    /// The endpoint received a message too big to process.
    Size,
    /// The client expected the server to negotiate an extension.
    Extension,
    /// The server encountered an unexpected condition.
    Error,
    /// The TLS handshake failed. Never sent on the wire.
    Tls,
    /// Codes in the reserved ranges.
    Reserved(u16),
    /// Codes registered with IANA (3000-3999).
    Iana(u16),
    /// Codes for private use by applications (4000-4999).
    Library(u16),
    /// Codes that can never appear in a close frame.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if the code may appear in a close frame received from a peer.
    ///
    /// The accepted set is `1000..=4999` without `1004..=1006` and `1012..=2999`.
    pub fn is_allowed(self) -> bool {
        let code = u16::from(self);
        (1000..=4999).contains(&code)
            && !(1004..=1006).contains(&code)
            && !(1012..=2999).contains(&code)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1015 => Self::Tls,
            1004 | 1012..=2999 => Self::Reserved(code),
            3000..=3999 => Self::Iana(code),
            4000..=4999 => Self::Library(code),
            _ => Self::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_codes() {
        for code in [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 3999, 4000, 4999] {
            assert!(CloseCode::from(code).is_allowed(), "{code} should be allowed");
        }
    }

    #[test]
    fn test_rejected_codes() {
        for code in [0, 999, 1004, 1005, 1006, 1012, 1013, 1014, 1015, 1016, 1100, 2000, 2999, 5000, 65535] {
            assert!(!CloseCode::from(code).is_allowed(), "{code} should be rejected");
        }
    }

    #[test]
    fn test_u16_round_trip() {
        for code in [1000u16, 1006, 1012, 2500, 3001, 4444, 5000] {
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
    }
}
