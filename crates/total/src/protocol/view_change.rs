//! View installation, sequence resets and blocking

use parking_lot::RwLockWriteGuard;
use tracing::{debug, error, info, warn};

use super::{CoreState, Inner, TotalOrder};
use crate::authority::SequencerIdentity;
use crate::delivery::Slot;
use crate::message::Scope;
use crate::state::ProtocolState;
use crate::view::{View, ViewEpoch};

impl TotalOrder {
    /// Install a new membership view
    ///
    /// Recomputes the sequencers, restarts the global order (and the subgroup
    /// order when the local subgroup changed size), replays this member's
    /// undelivered messages, and finally releases frames held for the new
    /// epoch.
    pub fn view_change(&self, view: View) {
        let inner = &self.inner;
        info!("View change to epoch {} with {} members", view.epoch(), view.members().len());

        let Some(mut core) = inner.core.try_write_for(inner.config.lock_timeout) else {
            error!("Timed out acquiring state lock for view {}", view.epoch());
            return;
        };

        let was_sequencer = core.is_sequencer(Scope::Global, None);

        core.state = ProtocolState::Running;
        core.epoch = view.epoch();
        core.authority = SequencerIdentity::resolve(&view);

        let subgroup_size = core
            .subgroup_name()
            .and_then(|name| core.authority.subgroup_members(name))
            .map_or(0, <[_]>::len);
        let subgroup_changed = subgroup_size != core.subgroup_size;

        let mcast_leftovers = if subgroup_changed {
            info!(
                "Subgroup {:?} changed size {} -> {}, restarting its order",
                core.subgroup_name(),
                core.subgroup_size,
                subgroup_size
            );
            core.subgroup_size = subgroup_size;
            Some(inner.restart_scope(Scope::Subgroup))
        } else {
            None
        };
        let bcast_leftovers = inner.restart_scope(Scope::Global);

        if core.is_sequencer(Scope::Global, None) && !was_sequencer {
            info!("This member is the new global sequencer");
        }
        if let Some(sequencer) = core.sequencer(Scope::Subgroup, core.subgroup_name()) {
            debug!("Subgroup sequencer is {}", sequencer);
        }

        let core = RwLockWriteGuard::downgrade(core);

        if let Some(leftovers) = mcast_leftovers {
            inner.replay(&core, Scope::Subgroup, leftovers);
        }
        inner.replay(&core, Scope::Global, bcast_leftovers);

        info!("View change to epoch {} complete", core.epoch);
        inner.transport.flush_complete();

        drop(core);
        inner.redeliver_held();
    }

    /// Restart both orders at `epoch` without a membership change
    pub fn reset_sequence(&self, epoch: ViewEpoch) {
        let inner = &self.inner;
        info!("Sequence reset to epoch {}", epoch);

        let Some(mut core) = inner.core.try_write_for(inner.config.lock_timeout) else {
            error!("Timed out acquiring state lock for sequence reset to {}", epoch);
            return;
        };

        core.state = ProtocolState::Running;
        core.epoch = epoch;

        let mcast_leftovers = inner.restart_scope(Scope::Subgroup);
        let bcast_leftovers = inner.restart_scope(Scope::Global);

        let core = RwLockWriteGuard::downgrade(core);
        inner.replay(&core, Scope::Subgroup, mcast_leftovers);
        inner.replay(&core, Scope::Global, bcast_leftovers);

        drop(core);
        inner.redeliver_held();
    }

    /// Prepare to block: `Running` becomes `Flushing`
    pub fn block(&self) {
        let inner = &self.inner;
        let Some(mut core) = inner.core.try_write_for(inner.config.lock_timeout) else {
            error!("Timed out acquiring state lock to block");
            return;
        };

        if core.state == ProtocolState::Running {
            core.state = ProtocolState::Flushing;
            info!("Flushing");
        } else {
            warn!("Ignoring block in state {}", core.state);
        }
    }

    /// Block acknowledged: stop sending until the next view
    pub fn block_ok(&self) {
        let inner = &self.inner;
        let Some(mut core) = inner.core.try_write_for(inner.config.lock_timeout) else {
            error!("Timed out acquiring state lock for block acknowledgement");
            return;
        };

        match core.state {
            ProtocolState::Running | ProtocolState::Flushing => {
                core.state = ProtocolState::Blocked;
                info!("Blocked");
            }
            ProtocolState::Blocked => debug!("Already blocked"),
            ProtocolState::Uninitialized => warn!("Ignoring block acknowledgement while uninitialized"),
        }
    }
}

impl Inner {
    /// Reset a scope's order counter and delivery buffer
    ///
    /// Returns the slots that were still waiting for delivery.
    fn restart_scope(&self, scope: Scope) -> Vec<(i64, Slot)> {
        let tables = self.tables(scope);
        tables.counters.order.reset();
        tables.buffer.lock().reset()
    }

    /// Resubmit this member's undelivered messages of `scope`
    ///
    /// Buffered slots this member originated go back through the request
    /// path under the correlation id they were first sent with; slots from
    /// other members are dropped. Pending requests are sent to the new
    /// sequencer at once.
    fn replay(&self, core: &CoreState, scope: Scope, leftovers: Vec<(i64, Slot)>) {
        let tables = self.tables(scope);
        let label = [scope.label()];
        let pending = tables.pending.ids();
        let subgroup = match scope {
            Scope::Global => None,
            _ => core.subgroup_name().map(str::to_string),
        };

        if !leftovers.is_empty() {
            info!("Replaying {} undelivered {} messages", leftovers.len(), scope);
        }

        for (order_id, slot) in leftovers {
            if core.local != Some(slot.source) {
                debug!("During replay: discarding {} {} from {}", scope, order_id, slot.source);
                continue;
            }
            if slot.is_null() {
                continue;
            }
            if scope != Scope::Global && subgroup.is_none() {
                warn!("No local subgroup to replay {} {} into", scope, order_id);
                continue;
            }

            self.metrics.replayed.with_label_values(&label).inc();
            self.submit(core, scope, slot.correlation_id, subgroup.clone(), slot.payload);
        }

        for correlation_id in pending {
            let Some(request) = tables.pending.get(correlation_id) else {
                continue;
            };
            self.metrics.replayed.with_label_values(&label).inc();

            if core.is_sequencer(scope, request.subgroup.as_deref()) {
                if tables.pending.take(correlation_id).is_some() {
                    tables.retransmit.ack(correlation_id);
                    self.sequence_locally(
                        core,
                        scope,
                        correlation_id,
                        request.subgroup.as_deref(),
                        request.payload,
                    );
                }
            } else {
                self.transmit_request(core, scope, correlation_id);
            }
        }
    }
}
