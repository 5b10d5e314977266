//! Inbound frame handling

use std::cmp::Ordering;

use bytes::Bytes;
use ordercast_transport::Address;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::outbound::{cast_kind, reply_kind};
use super::{CoreState, Inner};
use crate::delivery::{Insert, Slot};
use crate::header::{Frame, HeaderKind, NONE_ID, OrderingHeader};
use crate::message::{Delivery, Scope};
use crate::state::ProtocolState;

impl Inner {
    pub(super) fn receive(&self, sender: Address, bytes: Bytes) {
        match Frame::decode(bytes) {
            Ok(frame) => self.handle_frame(sender, frame),
            Err(e) => error!("Dropping frame from {}: {}", sender, e),
        }
    }

    pub(super) fn handle_frame(&self, sender: Address, frame: Frame) {
        let core = self.core.read();

        if core.state == ProtocolState::Uninitialized {
            debug!("Queueing frame from {} until the first view", sender);
            self.held.lock().push((sender, frame));
            return;
        }

        let Some(header) = frame.header else {
            self.deliver_upward(Delivery {
                source: sender,
                scope: Scope::Unordered,
                order_id: None,
                payload: frame.payload,
            });
            return;
        };

        match header.kind {
            HeaderKind::Ucast => self.deliver_upward(Delivery {
                source: sender,
                scope: Scope::Unicast,
                order_id: None,
                payload: frame.payload,
            }),
            HeaderKind::Bcast => self.on_cast(&core, Scope::Global, sender, header, frame.payload),
            HeaderKind::Mcast => {
                self.on_cast(&core, Scope::Subgroup, sender, header, frame.payload)
            }
            HeaderKind::Req => self.on_request(&core, Scope::Global, sender, header),
            HeaderKind::ReqMcast => self.on_request(&core, Scope::Subgroup, sender, header),
            HeaderKind::Rep => self.on_reply(&core, Scope::Global, sender, header),
            HeaderKind::RepMcast => self.on_reply(&core, Scope::Subgroup, sender, header),
            HeaderKind::None => error!("Unknown header type in {} from {}", header, sender),
        }
    }

    /// A sequenced message: fence by epoch, then buffer and deliver in order
    fn on_cast(
        &self,
        core: &CoreState,
        scope: Scope,
        sender: Address,
        header: OrderingHeader,
        payload: Bytes,
    ) {
        let label = [scope.label()];

        match header.view_epoch.cmp(&core.epoch) {
            Ordering::Less => {
                trace!("Discarding stale {} from {} (epoch {})", header, sender, core.epoch);
                self.metrics.stale_discarded.with_label_values(&label).inc();
                return;
            }
            Ordering::Greater => {
                debug!("Holding {} from {} until epoch {}", header, sender, header.view_epoch);
                self.metrics.future_buffered.with_label_values(&label).inc();
                self.held
                    .lock()
                    .push((sender, Frame::new(header, payload)));
                return;
            }
            Ordering::Equal => {}
        }

        let slot = Slot {
            source: sender,
            correlation_id: header.correlation_id,
            payload,
        };

        let mut buffer = self.tables(scope).buffer.lock();
        if buffer.insert(header.order_id, slot) == Insert::Duplicate {
            trace!(
                "{} order id {} already consumed (last delivered {})",
                scope,
                header.order_id,
                buffer.last_delivered()
            );
            self.metrics.duplicates_discarded.with_label_values(&label).inc();
            return;
        }

        let drained = buffer.drain(Instant::now());
        if !drained.ready.is_empty() || buffer.len() > 0 {
            debug!(
                "{} buffer: released {}, {} waiting",
                scope,
                drained.ready.len(),
                buffer.len()
            );
        }
        self.release(scope, drained);
    }

    /// A sequencing request: only the scope's sequencer answers
    fn on_request(&self, core: &CoreState, scope: Scope, sender: Address, header: OrderingHeader) {
        let subgroup = match scope {
            Scope::Global => None,
            _ => core.subgroup_name(),
        };

        if !core.is_sequencer(scope, subgroup) {
            error!("Received {} from {} but not the {} sequencer", header, sender, scope);
            return;
        }
        if !core.state.allows_sequencing() {
            info!("Discarding {} from {} while {}", header, sender, core.state);
            return;
        }

        let order_id = self.tables(scope).counters.order.next();
        self.metrics.sequenced.with_label_values(&[scope.label()]).inc();

        let reply = OrderingHeader::new(reply_kind(scope), header.correlation_id, order_id, core.epoch);
        debug!("Sequenced request {} from {} as {}", header.correlation_id, sender, order_id);
        self.send_to(&sender, &Frame::control(reply));
    }

    /// A sequencer reply: tag the parked payload and fan it out
    ///
    /// A reply without a pending entry still consumed an order id, so a null
    /// cast goes out in its place to keep the sequence gapless.
    fn on_reply(&self, core: &CoreState, scope: Scope, sender: Address, header: OrderingHeader) {
        let label = [scope.label()];

        if core.state == ProtocolState::Blocked {
            info!("Blocked, discarding {} from {}", header, sender);
            return;
        }
        if header.view_epoch < core.epoch {
            trace!("Ignoring stale {} from {} (epoch {})", header, sender, core.epoch);
            self.metrics.stale_discarded.with_label_values(&label).inc();
            return;
        }

        let tables = self.tables(scope);
        let (correlation_id, payload, subgroup) = match tables.pending.take(header.correlation_id) {
            Some(request) => {
                tables.retransmit.ack(request.correlation_id);
                (request.correlation_id, request.payload, request.subgroup)
            }
            None => {
                info!(
                    "{} reply to non-existent request {}, sending null cast",
                    scope, header.correlation_id
                );
                self.metrics.null_casts.with_label_values(&label).inc();
                (NONE_ID, Bytes::new(), None)
            }
        };

        // A null cast has no request to name its subgroup; the replying
        // sequencer's own subgroup stands in
        let subgroup = match scope {
            Scope::Global => None,
            _ => subgroup.or_else(|| core.authority.subgroup_of(&sender).map(str::to_string)),
        };
        if scope != Scope::Global && subgroup.is_none() {
            warn!("No subgroup for {} from {}, dropping", header, sender);
            return;
        }

        let cast = OrderingHeader::new(
            cast_kind(scope),
            correlation_id,
            header.order_id,
            header.view_epoch,
        );
        let recipients = self.cast_recipients(core, scope, subgroup.as_deref());
        debug!("Fanning out {} to {} members", cast, recipients.len());
        self.fan_out(&recipients, &Frame::new(cast, payload));
    }
}
