//! The total-order protocol instance
//!
//! A [`TotalOrder`] sits between the application and an unreliable
//! [`Transport`]. Broadcasts are ordered by the first member of the view,
//! multicasts by the first member of the target subgroup. Everything the
//! layer learns from the transport or the membership collaborator arrives
//! through the methods on this type.
//!
//! Locking: the protocol state sits behind one reader/writer lock. Message
//! handling holds the read side for its whole duration and passes the
//! guarded [`CoreState`] down by reference; transitions take the write side.
//! Counters, pending tables and delivery buffers have their own locks and are
//! always taken after the state lock, never before.

mod inbound;
mod outbound;
mod view_change;

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use ordercast_transport::{Address, Transport, TransportEnvelope};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::authority::SequencerIdentity;
use crate::config::TotalConfig;
use crate::counters::ScopeCounters;
use crate::delivery::{DeliveryBuffer, Drained};
use crate::error::{Result, TotalError};
use crate::header::Frame;
use crate::message::{Delivery, Scope};
use crate::metrics::{TotalMetrics, TotalStats};
use crate::pending::PendingTable;
use crate::retransmit::{RetransmitCommand, RetransmitOutcome, RetransmitScheduler};
use crate::state::ProtocolState;
use crate::view::ViewEpoch;

/// State guarded by the protocol's reader/writer lock
#[derive(Debug, Default)]
pub(crate) struct CoreState {
    pub(crate) state: ProtocolState,
    pub(crate) local: Option<Address>,
    pub(crate) epoch: ViewEpoch,
    pub(crate) authority: SequencerIdentity,
    pub(crate) local_subgroup: Option<String>,
    /// Size of the local subgroup in the last installed view
    pub(crate) subgroup_size: usize,
}

impl CoreState {
    /// Subgroup this member belongs to
    pub(crate) fn subgroup_name(&self) -> Option<&str> {
        self.local_subgroup.as_deref().or_else(|| {
            self.local
                .as_ref()
                .and_then(|local| self.authority.subgroup_of(local))
        })
    }

    /// Sequencer of `scope`, for a multicast to `subgroup`
    pub(crate) fn sequencer(&self, scope: Scope, subgroup: Option<&str>) -> Option<Address> {
        match scope {
            Scope::Global => self.authority.global_sequencer().copied(),
            _ => subgroup.and_then(|name| self.authority.subgroup_sequencer(name).copied()),
        }
    }

    /// Whether this member sequences `scope` for `subgroup`
    pub(crate) fn is_sequencer(&self, scope: Scope, subgroup: Option<&str>) -> bool {
        match (self.local, self.sequencer(scope, subgroup)) {
            (Some(local), Some(sequencer)) => local == sequencer,
            _ => false,
        }
    }
}

/// Counters, tables and timers of one ordering scope
pub(crate) struct ScopeTables {
    pub(crate) scope: Scope,
    pub(crate) counters: ScopeCounters,
    pub(crate) pending: PendingTable,
    pub(crate) buffer: Mutex<DeliveryBuffer>,
    pub(crate) retransmit: RetransmitScheduler,
}

impl ScopeTables {
    fn new(scope: Scope, config: &TotalConfig, intervals: Vec<Duration>, inner: Weak<Inner>) -> Self {
        let command: RetransmitCommand = Arc::new(move |correlation_id| match inner.upgrade() {
            Some(inner) => inner.retransmit(scope, correlation_id),
            None => RetransmitOutcome::Gone,
        });

        Self {
            scope,
            counters: ScopeCounters::default(),
            pending: PendingTable::default(),
            buffer: Mutex::new(DeliveryBuffer::new(config.op_timeout)),
            retransmit: RetransmitScheduler::spawn(scope.label(), intervals, command),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: TotalConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) core: RwLock<CoreState>,
    pub(crate) global: ScopeTables,
    pub(crate) subgroup: ScopeTables,
    /// Frames that arrived before their epoch, or before the first view
    pub(crate) held: Mutex<Vec<(Address, Frame)>>,
    pub(crate) upward: flume::Sender<Delivery>,
    pub(crate) metrics: TotalMetrics,
    pub(crate) runtime: Handle,
    /// Set once the instance is fully built
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    pub(crate) fn tables(&self, scope: Scope) -> &ScopeTables {
        match scope {
            Scope::Global => &self.global,
            _ => &self.subgroup,
        }
    }

    /// Send `frame` to one member, logging failures
    pub(crate) fn send_to(&self, recipient: &Address, frame: &Frame) {
        if let Err(e) = self.transport.send(recipient, frame.encode()) {
            warn!("Failed to send {:?} to {}: {}", frame.header, recipient, e);
        }
    }

    /// Send `frame` to every recipient, logging failures
    pub(crate) fn fan_out(&self, recipients: &[Address], frame: &Frame) {
        if recipients.is_empty() {
            warn!("No recipients for {:?}", frame.header);
            return;
        }
        if let Err(e) = self.transport.send_many(recipients, frame.encode()) {
            warn!("Failed to fan out {:?}: {}", frame.header, e);
        }
    }

    pub(crate) fn deliver_upward(&self, delivery: Delivery) {
        if self.upward.send(delivery).is_err() {
            debug!("Delivery receiver dropped, discarding message");
        }
    }

    /// Pass up whatever the delivery loop released
    ///
    /// Called with the scope's buffer lock held so concurrent drains cannot
    /// interleave their output.
    pub(crate) fn release(&self, scope: Scope, drained: Drained) {
        let label = [scope.label()];

        for order_id in drained.skipped {
            error!(
                "{} delivery bypassed missing message {} after {:?}",
                scope, order_id, self.config.op_timeout
            );
            self.metrics.skipped.with_label_values(&label).inc();
        }

        for (order_id, slot) in drained.ready {
            if slot.is_null() {
                debug!("{} slot {} was a null cast", scope, order_id);
                continue;
            }

            debug!("Delivering {} message {} from {}", scope, order_id, slot.source);
            self.metrics.delivered.with_label_values(&label).inc();
            self.deliver_upward(Delivery {
                source: slot.source,
                scope,
                order_id: Some(order_id),
                payload: slot.payload,
            });
        }
    }

    /// Re-run the delivery loop of both buffers
    fn sweep(&self) {
        let now = Instant::now();
        for tables in [&self.global, &self.subgroup] {
            let mut buffer = tables.buffer.lock();
            let drained = buffer.drain(now);
            self.release(tables.scope, drained);
        }
    }

    /// Hand frames held for a later epoch back to the receive path
    pub(crate) fn redeliver_held(self: &Arc<Self>) {
        let held = std::mem::take(&mut *self.held.lock());
        if held.is_empty() {
            return;
        }

        debug!("Redelivering {} held frames", held.len());
        let inner = self.clone();
        self.runtime.spawn(async move {
            for (sender, frame) in held {
                inner.handle_frame(sender, frame);
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

async fn sweep_gaps(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match inner.upgrade() {
            Some(inner) => inner.sweep(),
            None => break,
        }
    }
}

/// Handle to a total-order protocol instance
///
/// Cloning is cheap; all clones drive the same instance.
#[derive(Clone)]
pub struct TotalOrder {
    inner: Arc<Inner>,
}

impl TotalOrder {
    /// Create a protocol instance over `transport`
    ///
    /// Returns the handle and the stream of messages delivered upward. Must
    /// be called within a tokio runtime; retransmission timers, the gap
    /// sweeper and redelivery run as tasks on it.
    pub fn new(
        config: TotalConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, flume::Receiver<Delivery>)> {
        config.validate()?;

        let runtime = Handle::try_current()
            .map_err(|e| TotalError::Runtime(format!("no tokio runtime: {e}")))?;
        let metrics = TotalMetrics::new()?;
        let (upward, deliveries) = flume::unbounded();

        let core = CoreState {
            local_subgroup: config.subgroup.clone(),
            ..Default::default()
        };

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let global = ScopeTables::new(
                Scope::Global,
                &config,
                config.retransmit_intervals.clone(),
                weak.clone(),
            );
            let subgroup = ScopeTables::new(
                Scope::Subgroup,
                &config,
                config.mcast_retransmit_intervals.clone(),
                weak.clone(),
            );
            Inner {
                config,
                transport,
                core: RwLock::new(core),
                global,
                subgroup,
                held: Mutex::new(Vec::new()),
                upward,
                metrics,
                runtime: runtime.clone(),
                sweeper: Mutex::new(None),
            }
        });

        // The sweeper must not start before the Arc exists
        let sweeper = runtime.spawn(sweep_gaps(
            Arc::downgrade(&inner),
            inner.config.gap_check_interval,
        ));
        *inner.sweeper.lock() = Some(sweeper);

        Ok((Self { inner }, deliveries))
    }

    /// Record the address the transport assigned to this member
    pub fn set_local_address(&self, address: Address) {
        let Some(mut core) = self.inner.core.try_write_for(self.inner.config.lock_timeout) else {
            error!("Timed out setting local address {}", address);
            return;
        };
        info!("Local address is {}", address);
        core.local = Some(address);
    }

    /// Join subgroup `name` for multicast ordering
    pub fn set_local_subgroup(&self, name: impl Into<String>) {
        let name = name.into();
        let Some(mut core) = self.inner.core.try_write_for(self.inner.config.lock_timeout) else {
            error!("Timed out setting local subgroup {}", name);
            return;
        };
        info!("Local subgroup is {}", name);
        core.local_subgroup = Some(name);
    }

    /// Decode and handle a frame received from `sender`
    pub fn receive(&self, sender: Address, frame: Bytes) {
        self.inner.receive(sender, frame);
    }

    /// Pump a transport's inbound channel into [`receive`](Self::receive)
    ///
    /// The task ends when the channel closes or the instance is dropped.
    pub fn spawn_receiver(&self, inbound: flume::Receiver<TransportEnvelope>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            while let Ok(envelope) = inbound.recv_async().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.receive(envelope.sender, envelope.payload);
            }
            debug!("Receiver task finished");
        })
    }

    /// Force the layer back to `Uninitialized` and clear every table
    pub fn stop(&self) {
        let inner = &self.inner;
        let Some(mut core) = inner.core.try_write_for(inner.config.lock_timeout) else {
            error!("Timed out acquiring state lock to stop");
            return;
        };

        core.state = ProtocolState::Uninitialized;
        core.local = None;
        core.epoch = ViewEpoch::UNSET;
        core.authority = SequencerIdentity::default();
        core.subgroup_size = 0;

        for tables in [&inner.global, &inner.subgroup] {
            tables.retransmit.reset();
            tables.pending.clear();
            tables.counters.order.reset();
            tables.buffer.lock().reset();
        }
        inner.held.lock().clear();

        info!("Stopped");
    }

    /// Current protocol state
    pub fn state(&self) -> ProtocolState {
        self.inner.core.read().state
    }

    /// Epoch of the installed view
    pub fn view_epoch(&self) -> ViewEpoch {
        self.inner.core.read().epoch
    }

    /// Address assigned by the transport, if any
    pub fn local_address(&self) -> Option<Address> {
        self.inner.core.read().local
    }

    /// Whether this member currently sequences broadcasts
    pub fn is_global_sequencer(&self) -> bool {
        self.inner.core.read().is_sequencer(Scope::Global, None)
    }

    /// Number of requests still waiting for their order id in `scope`
    pub fn pending_requests(&self, scope: Scope) -> usize {
        self.inner.tables(scope).pending.len()
    }

    /// Snapshot of the protocol counters
    pub fn stats(&self) -> TotalStats {
        self.inner.metrics.snapshot()
    }

    /// The prometheus metrics of this instance
    pub fn metrics(&self) -> &TotalMetrics {
        &self.inner.metrics
    }
}
