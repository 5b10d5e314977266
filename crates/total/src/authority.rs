//! Sequence authority resolution
//!
//! Which member mints order ids is a pure function of the installed view:
//! the first member of the view sequences broadcasts, and the first member
//! of each subgroup sequences that subgroup's multicasts.

use std::collections::{BTreeMap, HashMap};

use ordercast_transport::Address;

use crate::view::View;

/// Sequencer identities derived from a view
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequencerIdentity {
    members: Vec<Address>,
    global: Option<Address>,
    subgroups: BTreeMap<String, Vec<Address>>,
    member_subgroup: HashMap<Address, String>,
}

impl SequencerIdentity {
    /// Derive sequencer identities from `view`
    pub fn resolve(view: &View) -> Self {
        let mut member_subgroup = HashMap::new();
        for (name, members) in view.subgroups() {
            for member in members {
                member_subgroup.insert(*member, name.clone());
            }
        }

        Self {
            members: view.members().to_vec(),
            global: view.coordinator().copied(),
            subgroups: view.subgroups().clone(),
            member_subgroup,
        }
    }

    /// Members of the view, in view order
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// The global sequencer
    pub fn global_sequencer(&self) -> Option<&Address> {
        self.global.as_ref()
    }

    /// The sequencer of subgroup `name`
    pub fn subgroup_sequencer(&self, name: &str) -> Option<&Address> {
        self.subgroups.get(name).and_then(|members| members.first())
    }

    /// Members of subgroup `name`
    pub fn subgroup_members(&self, name: &str) -> Option<&[Address]> {
        self.subgroups.get(name).map(Vec::as_slice)
    }

    /// The subgroup `address` belongs to
    pub fn subgroup_of(&self, address: &Address) -> Option<&str> {
        self.member_subgroup.get(address).map(String::as_str)
    }

    /// The subgroup a multicast to `destinations` is scoped to
    ///
    /// The first destination still mapped to a subgroup decides; destinations
    /// that left the view are skipped.
    pub fn subgroup_for(&self, destinations: &[Address]) -> Option<&str> {
        destinations.iter().find_map(|dest| self.subgroup_of(dest))
    }
}
