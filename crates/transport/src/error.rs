//! Error types for transport operations

use thiserror::Error;

use crate::Address;

/// Transport-related errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Address already registered with this transport
    #[error("Address {0} is already in use")]
    AddressInUse(Address),

    /// The transport has been shut down
    #[error("Transport is closed")]
    Closed,

    /// Invalid address string
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Recipient is not known to the transport
    #[error("Unknown recipient {0}")]
    UnknownRecipient(Address),
}
