//! Outbound request path

use bytes::Bytes;
use ordercast_transport::Address;
use tracing::{debug, error, warn};

use super::{CoreState, Inner, TotalOrder};
use crate::header::{Frame, HeaderKind, OrderingHeader};
use crate::message::{DiscardReason, Outbound, Scope, SendOutcome};
use crate::pending::PendingRequest;
use crate::retransmit::RetransmitOutcome;
use crate::state::ProtocolState;

impl TotalOrder {
    /// Hand a message down for ordered (or unicast) delivery
    pub fn send(&self, outbound: Outbound) -> SendOutcome {
        let inner = &self.inner;
        let core = inner.core.read();

        if !core.state.accepts_sends() {
            error!("Discarding send while {}", core.state);
            let reason = match core.state {
                ProtocolState::Uninitialized => DiscardReason::Uninitialized,
                _ => DiscardReason::Blocked,
            };
            return SendOutcome::Discarded(reason);
        }

        match outbound {
            Outbound::Broadcast(payload) => {
                let correlation_id = inner.global.counters.correlation.next();
                inner.submit(&core, Scope::Global, correlation_id, None, payload)
            }
            Outbound::Multicast {
                destinations,
                payload,
            } => {
                let Some(subgroup) = core.authority.subgroup_for(&destinations) else {
                    error!("No subgroup for multicast to {:?}", destinations);
                    return SendOutcome::Discarded(DiscardReason::NoSubgroup);
                };
                let subgroup = subgroup.to_string();
                let correlation_id = inner.subgroup.counters.correlation.next();
                inner.submit(&core, Scope::Subgroup, correlation_id, Some(subgroup), payload)
            }
            Outbound::Unicast {
                destination,
                payload,
            } => {
                inner.send_to(&destination, &Frame::new(OrderingHeader::unicast(), payload));
                SendOutcome::Unicast
            }
        }
    }
}

impl Inner {
    /// Get `payload` ordered in `scope` under `correlation_id`
    ///
    /// The sequencer mints the order id itself; everyone else parks the
    /// payload and asks the sequencer.
    pub(super) fn submit(
        &self,
        core: &CoreState,
        scope: Scope,
        correlation_id: i64,
        subgroup: Option<String>,
        payload: Bytes,
    ) -> SendOutcome {
        if core.sequencer(scope, subgroup.as_deref()).is_none() {
            error!("No {} sequencer, discarding request {}", scope, correlation_id);
            return SendOutcome::Discarded(DiscardReason::NoSequencer);
        }

        if core.is_sequencer(scope, subgroup.as_deref()) {
            let order_id =
                self.sequence_locally(core, scope, correlation_id, subgroup.as_deref(), payload);
            return SendOutcome::Sequenced { order_id };
        }

        let tables = self.tables(scope);
        tables.pending.insert(PendingRequest {
            correlation_id,
            payload,
            subgroup,
        });
        self.transmit_request(core, scope, correlation_id);
        tables.retransmit.add(correlation_id);

        SendOutcome::Requested { correlation_id }
    }

    /// Mint the next order id and fan the message out directly
    pub(super) fn sequence_locally(
        &self,
        core: &CoreState,
        scope: Scope,
        correlation_id: i64,
        subgroup: Option<&str>,
        payload: Bytes,
    ) -> i64 {
        let order_id = self.tables(scope).counters.order.next();
        self.metrics.sequenced.with_label_values(&[scope.label()]).inc();
        debug!("Shortcut {} order id {} for request {}", scope, order_id, correlation_id);

        let header = OrderingHeader::new(cast_kind(scope), correlation_id, order_id, core.epoch);
        let recipients = self.cast_recipients(core, scope, subgroup);
        self.fan_out(&recipients, &Frame::new(header, payload));

        order_id
    }

    /// Send the sequencing request for a pending entry
    pub(super) fn transmit_request(
        &self,
        core: &CoreState,
        scope: Scope,
        correlation_id: i64,
    ) -> RetransmitOutcome {
        if !core.state.allows_sequencing() {
            debug!("Not transmitting {} request {} while {}", scope, correlation_id, core.state);
            return RetransmitOutcome::Suppressed;
        }

        let Some(request) = self.tables(scope).pending.get(correlation_id) else {
            return RetransmitOutcome::Gone;
        };

        let Some(sequencer) = core.sequencer(scope, request.subgroup.as_deref()) else {
            warn!("No {} sequencer for request {}", scope, correlation_id);
            return RetransmitOutcome::Suppressed;
        };

        let header = OrderingHeader::request(request_kind(scope), correlation_id, core.epoch);
        debug!("Sending {} to {}", header, sequencer);
        self.send_to(&sequencer, &Frame::control(header));

        RetransmitOutcome::Sent
    }

    /// Timer callback of the retransmission schedulers
    pub(super) fn retransmit(&self, scope: Scope, correlation_id: i64) -> RetransmitOutcome {
        let core = self.core.read();
        let outcome = self.transmit_request(&core, scope, correlation_id);
        if outcome == RetransmitOutcome::Sent {
            debug!("Retransmitted {} request {}", scope, correlation_id);
            self.metrics
                .retransmissions
                .with_label_values(&[scope.label()])
                .inc();
        }
        outcome
    }

    /// Members a sequenced message of `scope` goes to
    pub(super) fn cast_recipients(
        &self,
        core: &CoreState,
        scope: Scope,
        subgroup: Option<&str>,
    ) -> Vec<Address> {
        match scope {
            Scope::Global => core.authority.members().to_vec(),
            _ => subgroup
                .and_then(|name| core.authority.subgroup_members(name))
                .map(<[Address]>::to_vec)
                .unwrap_or_default(),
        }
    }
}

pub(super) fn request_kind(scope: Scope) -> HeaderKind {
    match scope {
        Scope::Global => HeaderKind::Req,
        _ => HeaderKind::ReqMcast,
    }
}

pub(super) fn reply_kind(scope: Scope) -> HeaderKind {
    match scope {
        Scope::Global => HeaderKind::Rep,
        _ => HeaderKind::RepMcast,
    }
}

pub(super) fn cast_kind(scope: Scope) -> HeaderKind {
    match scope {
        Scope::Global => HeaderKind::Bcast,
        _ => HeaderKind::Mcast,
    }
}
