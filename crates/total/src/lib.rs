//! Sequencer-based total-order broadcast and subgroup multicast
//!
//! This crate imposes a single delivery order on broadcasts sent by any
//! cluster member, and a per-subgroup order on scoped multicasts, on top of
//! an unreliable point-to-point [`Transport`](ordercast_transport::Transport):
//! - The first member of the view mints global order ids
//! - The first member of each subgroup mints that subgroup's order ids
//! - Other members ask the sequencer with a request/reply exchange,
//!   retransmitting until answered
//! - Receivers buffer out-of-order arrivals and deliver strictly in order,
//!   skipping a missing id only after a bounded wait
//! - View changes restart the order and replay this member's in-flight
//!   messages

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Sequence authority resolution
pub mod authority;

/// Configuration types
pub mod config;

pub(crate) mod counters;

pub(crate) mod delivery;

/// Error types
pub mod error;

/// Wire model of the ordering header
pub mod header;

/// Application-facing message types
pub mod message;

/// Prometheus metrics
pub mod metrics;

pub(crate) mod pending;

mod protocol;

pub(crate) mod retransmit;

/// Protocol state machine
pub mod state;

/// Membership views
pub mod view;

pub use authority::SequencerIdentity;
pub use config::TotalConfig;
pub use error::{Result, TotalError};
pub use header::{Frame, HeaderKind, NONE_ID, OrderingHeader};
pub use message::{Delivery, DiscardReason, Outbound, Scope, SendOutcome};
pub use metrics::{ScopeStats, TotalMetrics, TotalStats};
pub use protocol::TotalOrder;
pub use state::ProtocolState;
pub use view::{View, ViewEpoch};
