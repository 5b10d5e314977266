//! Protocol state machine

use std::fmt;

/// Process-wide sending state of the layer
///
/// ```text
/// Uninitialized --view_change--> Running --block--> Flushing --block_ok--> Blocked
///                                   ^                   |                     |
///                                   +----view_change----+---------------------+
/// ```
///
/// `stop()` forces `Uninitialized` from anywhere.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    /// No view installed yet; inbound frames are queued, sends discarded
    #[default]
    Uninitialized,
    /// Normal operation
    Running,
    /// Preparing to block; everything still flows
    Flushing,
    /// Sends, retransmissions and sequencing requests are suppressed
    Blocked,
}

impl ProtocolState {
    /// Whether application sends are accepted
    pub fn accepts_sends(&self) -> bool {
        matches!(self, Self::Running | Self::Flushing)
    }

    /// Whether requests may be (re)transmitted and sequenced
    pub fn allows_sequencing(&self) -> bool {
        matches!(self, Self::Running | Self::Flushing)
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Running => "running",
            Self::Flushing => "flushing",
            Self::Blocked => "blocked",
        };
        f.write_str(name)
    }
}
