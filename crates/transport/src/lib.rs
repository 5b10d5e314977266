//! Point-to-point transport abstraction for the ordering layer
//!
//! This crate provides the transport-agnostic interface the total-order layer
//! sends and receives through. Concrete transports live in separate crates.
//!
//! Transports are assumed to be unreliable:
//! - Frames may be lost
//! - Frames may be duplicated
//! - Frames may be reordered
//!
//! Sends never block on the network. They enqueue the frame and return, which
//! lets callers send while holding their own locks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use error::TransportError;

/// Address of a cluster member
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Address(SocketAddr);

impl Address {
    /// Create an address from a socket address
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// Loopback address on the given port, handy for in-process clusters
    pub fn localhost(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// The underlying socket address
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0.ip(), self.0.port())
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self)
            .map_err(|e| TransportError::InvalidAddress(format!("{s}: {e}")))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

/// An inbound frame together with the member that sent it
#[derive(Debug, Clone)]
pub struct TransportEnvelope {
    /// The sender of the frame
    pub sender: Address,
    /// The raw frame
    pub payload: Bytes,
}

/// Transport trait consumed by the ordering layer
///
/// Implementations deliver inbound frames out of band (typically through a
/// channel of [`TransportEnvelope`]s) and make no ordering or delivery
/// guarantees.
pub trait Transport: Send + Sync + 'static {
    /// Enqueue a frame for a single recipient
    fn send(&self, recipient: &Address, payload: Bytes) -> Result<(), TransportError>;

    /// Enqueue a frame for an explicit list of recipients
    ///
    /// Every recipient is attempted. The first failure, if any, is returned.
    fn send_many(&self, recipients: &[Address], payload: Bytes) -> Result<(), TransportError> {
        let mut first_error = None;

        for recipient in recipients {
            if let Err(e) = self.send(recipient, payload.clone()) {
                warn!("Failed to send frame to {}: {}", recipient, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Signal that the layer above finished installing a view
    fn flush_complete(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    struct Recording {
        sent: Mutex<Vec<Address>>,
        unreachable: Address,
    }

    impl Transport for Recording {
        fn send(&self, recipient: &Address, _payload: Bytes) -> Result<(), TransportError> {
            if *recipient == self.unreachable {
                return Err(TransportError::UnknownRecipient(*recipient));
            }
            self.sent.lock().unwrap().push(*recipient);
            Ok(())
        }
    }

    #[test]
    fn test_address_display_and_parse() {
        let addr = Address::localhost(7800);
        assert_eq!(addr.to_string(), "127.0.0.1:7800");

        let parsed: Address = "127.0.0.1:7800".parse().unwrap();
        assert_eq!(parsed, addr);

        assert!(matches!(
            "not-an-address".parse::<Address>(),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_address_ordering_follows_port() {
        let mut addrs = vec![
            Address::localhost(3),
            Address::localhost(1),
            Address::localhost(2),
        ];
        addrs.sort();
        assert_eq!(addrs[0], Address::localhost(1));
        assert_eq!(addrs[2], Address::localhost(3));
    }

    #[test]
    fn test_address_serde_roundtrip() {
        let addr = Address::localhost(9000);
        let json = serde_json::to_string(&addr).unwrap();
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_send_many_attempts_every_recipient() {
        let transport = Recording {
            sent: Mutex::new(Vec::new()),
            unreachable: Address::localhost(2),
        };
        let recipients = [
            Address::localhost(1),
            Address::localhost(2),
            Address::localhost(3),
        ];

        let result = transport.send_many(&recipients, Bytes::from_static(b"x"));

        assert_eq!(
            result,
            Err(TransportError::UnknownRecipient(Address::localhost(2)))
        );
        assert_eq!(
            *transport.sent.lock().unwrap(),
            vec![Address::localhost(1), Address::localhost(3)]
        );
    }
}
