//! Messages exchanged with the application layer

use std::fmt;

use bytes::Bytes;
use ordercast_transport::Address;

/// Ordering scope of a delivered message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Ordered across the whole view
    Global,
    /// Ordered within the local subgroup
    Subgroup,
    /// Point-to-point, no ordering
    Unicast,
    /// Arrived without an ordering header
    Unordered,
}

impl Scope {
    /// Metric label of the scope
    pub fn label(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Subgroup => "subgroup",
            Self::Unicast => "unicast",
            Self::Unordered => "unordered",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A message handed up to the application, header stripped
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Member that originated the message
    pub source: Address,
    /// Ordering scope
    pub scope: Scope,
    /// Position within the scope, for ordered scopes
    pub order_id: Option<i64>,
    /// Application payload
    pub payload: Bytes,
}

/// A message handed down by the application
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Deliver to every member of the view in global order
    Broadcast(Bytes),
    /// Deliver to a subgroup in subgroup order
    Multicast {
        /// Members the multicast is addressed to; they select the subgroup
        destinations: Vec<Address>,
        /// Application payload
        payload: Bytes,
    },
    /// Deliver to a single member, unordered
    Unicast {
        /// Recipient
        destination: Address,
        /// Application payload
        payload: Bytes,
    },
}

impl Outbound {
    /// Convenience constructor for a broadcast
    pub fn broadcast(payload: impl Into<Bytes>) -> Self {
        Self::Broadcast(payload.into())
    }

    /// Convenience constructor for a multicast
    pub fn multicast(destinations: Vec<Address>, payload: impl Into<Bytes>) -> Self {
        Self::Multicast {
            destinations,
            payload: payload.into(),
        }
    }

    /// Convenience constructor for a unicast
    pub fn unicast(destination: Address, payload: impl Into<Bytes>) -> Self {
        Self::Unicast {
            destination,
            payload: payload.into(),
        }
    }
}

/// Why a send was dropped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscardReason {
    /// No view installed, or the layer was stopped
    Uninitialized,
    /// The layer is blocked for a view change
    Blocked,
    /// No destination maps to a known subgroup
    NoSubgroup,
    /// No sequencer is known for the scope
    NoSequencer,
}

/// What happened to a send
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// This member is the sequencer and assigned the order id directly
    Sequenced {
        /// Assigned order id
        order_id: i64,
    },
    /// A sequencing request went to the sequencer
    Requested {
        /// Correlation id the reply will carry
        correlation_id: i64,
    },
    /// Sent point-to-point
    Unicast,
    /// Dropped without sending
    Discarded(DiscardReason),
}
