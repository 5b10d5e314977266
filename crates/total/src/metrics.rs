//! Prometheus metrics for the total-order layer
//!
//! Every counter is labelled by `scope`: `global` for broadcast traffic and
//! `subgroup` for multicast traffic. Each protocol instance owns its own
//! registry so several members can live in one process.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TotalError};
use crate::message::Scope;

/// Counters of the total-order layer
pub struct TotalMetrics {
    registry: Registry,
    /// Messages passed up in order
    pub delivered: IntCounterVec,
    /// Order ids force-skipped after the gap timeout
    pub skipped: IntCounterVec,
    /// Sequencing requests retransmitted
    pub retransmissions: IntCounterVec,
    /// Null casts sent to fill order ids of duplicate replies
    pub null_casts: IntCounterVec,
    /// Frames discarded for carrying an older epoch
    pub stale_discarded: IntCounterVec,
    /// Frames discarded for carrying an already consumed order id
    pub duplicates_discarded: IntCounterVec,
    /// Frames parked until the local epoch catches up
    pub future_buffered: IntCounterVec,
    /// Requests resubmitted on a view change or reset
    pub replayed: IntCounterVec,
    /// Order ids minted by this member as sequencer
    pub sequenced: IntCounterVec,
}

impl TotalMetrics {
    /// Create the counters in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounterVec> {
            let vec = IntCounterVec::new(Opts::new(name, help), &["scope"])?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        let delivered = counter("total_delivered_total", "Messages delivered in order")?;
        let skipped = counter("total_skipped_total", "Order ids skipped after a gap timeout")?;
        let retransmissions = counter(
            "total_retransmissions_total",
            "Sequencing requests retransmitted",
        )?;
        let null_casts = counter("total_null_casts_total", "Null casts sent for duplicate replies")?;
        let stale_discarded = counter(
            "total_stale_discarded_total",
            "Frames discarded for an older view epoch",
        )?;
        let duplicates_discarded = counter(
            "total_duplicates_discarded_total",
            "Frames discarded for an already consumed order id",
        )?;
        let future_buffered = counter(
            "total_future_buffered_total",
            "Frames held for a newer view epoch",
        )?;
        let replayed = counter(
            "total_replayed_total",
            "Requests resubmitted after a view change",
        )?;
        let sequenced = counter("total_sequenced_total", "Order ids minted as sequencer")?;

        Ok(Self {
            registry,
            delivered,
            skipped,
            retransmissions,
            null_casts,
            stale_discarded,
            duplicates_discarded,
            future_buffered,
            replayed,
            sequenced,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| TotalError::Decode(e.to_string()))
    }

    /// Snapshot of every counter
    pub fn snapshot(&self) -> TotalStats {
        TotalStats {
            global: self.scope_stats(Scope::Global),
            subgroup: self.scope_stats(Scope::Subgroup),
        }
    }

    fn scope_stats(&self, scope: Scope) -> ScopeStats {
        let label = [scope.label()];
        let get = |vec: &IntCounterVec| vec.with_label_values(&label).get();

        ScopeStats {
            delivered: get(&self.delivered),
            skipped: get(&self.skipped),
            retransmissions: get(&self.retransmissions),
            null_casts: get(&self.null_casts),
            stale_discarded: get(&self.stale_discarded),
            duplicates_discarded: get(&self.duplicates_discarded),
            future_buffered: get(&self.future_buffered),
            replayed: get(&self.replayed),
            sequenced: get(&self.sequenced),
        }
    }
}

/// Counter values of one ordering scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeStats {
    /// Messages delivered in order
    pub delivered: u64,
    /// Order ids skipped after a gap timeout
    pub skipped: u64,
    /// Requests retransmitted
    pub retransmissions: u64,
    /// Null casts sent
    pub null_casts: u64,
    /// Stale frames discarded
    pub stale_discarded: u64,
    /// Duplicate frames discarded
    pub duplicates_discarded: u64,
    /// Future-epoch frames held back
    pub future_buffered: u64,
    /// Requests replayed
    pub replayed: u64,
    /// Order ids minted
    pub sequenced: u64,
}

/// Counter snapshot of a protocol instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalStats {
    /// Broadcast scope
    pub global: ScopeStats,
    /// Multicast scope
    pub subgroup: ScopeStats,
}

impl TotalStats {
    /// Stats of `scope`; unordered scopes have none
    pub fn scope(&self, scope: Scope) -> ScopeStats {
        match scope {
            Scope::Global => self.global,
            Scope::Subgroup => self.subgroup,
            Scope::Unicast | Scope::Unordered => ScopeStats::default(),
        }
    }
}
