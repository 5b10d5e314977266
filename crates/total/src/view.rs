//! Membership views as delivered by the membership collaborator

use std::collections::BTreeMap;
use std::fmt;

use ordercast_transport::Address;
use serde::{Deserialize, Serialize};

/// Generation number of a view
///
/// Every ordering header carries the epoch its order id was minted in.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ViewEpoch(i32);

impl ViewEpoch {
    /// Epoch before any view was installed
    pub const UNSET: Self = Self(-1);

    /// Wrap a raw epoch
    pub const fn new(epoch: i32) -> Self {
        Self(epoch)
    }

    /// The raw epoch value
    pub const fn get(&self) -> i32 {
        self.0
    }
}

impl Default for ViewEpoch {
    fn default() -> Self {
        Self::UNSET
    }
}

impl fmt::Display for ViewEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An already-computed membership snapshot
///
/// Member order matters: the first member of the view is the global
/// sequencer, and the first member of each subgroup list is that subgroup's
/// sequencer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    epoch: ViewEpoch,
    members: Vec<Address>,
    subgroups: BTreeMap<String, Vec<Address>>,
}

impl View {
    /// Create a view without subgroups
    pub fn new(epoch: ViewEpoch, members: Vec<Address>) -> Self {
        Self {
            epoch,
            members,
            subgroups: BTreeMap::new(),
        }
    }

    /// Add (or replace) a subgroup
    pub fn with_subgroup(mut self, name: impl Into<String>, members: Vec<Address>) -> Self {
        self.subgroups.insert(name.into(), members);
        self
    }

    /// The view's epoch
    pub fn epoch(&self) -> ViewEpoch {
        self.epoch
    }

    /// Members in view order
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// Subgroup name to member list
    pub fn subgroups(&self) -> &BTreeMap<String, Vec<Address>> {
        &self.subgroups
    }

    /// The first member, if any
    pub fn coordinator(&self) -> Option<&Address> {
        self.members.first()
    }
}
