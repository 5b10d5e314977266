//! In-memory transport implementation for testing
//!
//! This transport routes frames between members within the same process.
//! Every [`MemoryNetwork`] is an isolated registry, so tests running in
//! parallel never see each other's traffic.
//!
//! The network can misbehave on purpose:
//! - Packet loss (`drop_rate`)
//! - Duplication (`duplicate_rate`)
//! - Latency injection (`latency`), which also reorders frames
//! - Partitions between pairs of members
//! - Arbitrary frame filters for deterministic fault scenarios

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use ordercast_transport::{Address, Transport, TransportEnvelope, TransportError};
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, trace};

/// Decides whether a frame from `from` to `to` is allowed through
pub type FrameFilter = Arc<dyn Fn(&Address, &Address, &Bytes) -> bool + Send + Sync>;

/// Fault injection settings applied to every routed frame
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Probability of dropping a frame (0.0 - 1.0)
    pub drop_rate: f64,
    /// Probability of delivering a frame twice (0.0 - 1.0)
    pub duplicate_rate: f64,
    /// Range of latency injected per frame
    pub latency: (Duration, Duration),
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            latency: (Duration::ZERO, Duration::ZERO),
        }
    }
}

/// Point-in-time copy of the network counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Frames handed to the network
    pub sent: u64,
    /// Frames pushed into a recipient's channel
    pub delivered: u64,
    /// Frames lost to faults, partitions or filters
    pub dropped: u64,
    /// Extra copies produced by duplication
    pub duplicated: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
}

impl Counters {
    /// Account for a frame handed to a recipient's channel
    fn record_send(&self, to: &Address, pushed: bool) {
        if pushed {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        } else {
            debug!("Receiver for {} is gone, frame lost", to);
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct Endpoint {
    sender: flume::Sender<TransportEnvelope>,
    flushes: Arc<AtomicU64>,
}

struct NetworkInner {
    endpoints: DashMap<Address, Endpoint>,
    faults: RwLock<FaultConfig>,
    partitions: RwLock<HashSet<(Address, Address)>>,
    filter: RwLock<Option<FrameFilter>>,
    counters: Arc<Counters>,
}

/// An isolated in-process network
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("endpoints", &self.inner.endpoints.len())
            .field("faults", &*self.inner.faults.read())
            .finish()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create a network that delivers every frame exactly once
    pub fn new() -> Self {
        Self::with_faults(FaultConfig::default())
    }

    /// Create a network with the given fault settings
    pub fn with_faults(faults: FaultConfig) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: DashMap::new(),
                faults: RwLock::new(faults),
                partitions: RwLock::new(HashSet::new()),
                filter: RwLock::new(None),
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    /// Register a member and get its transport plus inbound channel
    pub fn endpoint(
        &self,
        address: Address,
    ) -> Result<(MemoryTransport, flume::Receiver<TransportEnvelope>), TransportError> {
        if self.inner.endpoints.contains_key(&address) {
            return Err(TransportError::AddressInUse(address));
        }

        let (sender, receiver) = flume::unbounded();
        let flushes = Arc::new(AtomicU64::new(0));
        self.inner.endpoints.insert(
            address,
            Endpoint {
                sender,
                flushes: flushes.clone(),
            },
        );

        info!("Memory endpoint registered for {}", address);

        let transport = MemoryTransport {
            local: address,
            network: self.inner.clone(),
            flushes,
            closed: AtomicBool::new(false),
        };

        Ok((transport, receiver))
    }

    /// Unregister a member; frames sent to it afterwards fail
    pub fn remove(&self, address: &Address) {
        if self.inner.endpoints.remove(address).is_some() {
            info!("Memory endpoint removed for {}", address);
        }
    }

    /// Replace the fault settings
    pub fn set_faults(&self, faults: FaultConfig) {
        *self.inner.faults.write() = faults;
    }

    /// Drop all traffic between `a` and `b`, in both directions
    pub fn partition(&self, a: Address, b: Address) {
        let mut partitions = self.inner.partitions.write();
        partitions.insert((a, b));
        partitions.insert((b, a));
    }

    /// Restore traffic between `a` and `b`
    pub fn heal(&self, a: Address, b: Address) {
        let mut partitions = self.inner.partitions.write();
        partitions.remove(&(a, b));
        partitions.remove(&(b, a));
    }

    /// Remove every partition
    pub fn heal_all(&self) {
        self.inner.partitions.write().clear();
    }

    /// Install a frame filter; frames for which it returns `false` are dropped
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&Address, &Address, &Bytes) -> bool + Send + Sync + 'static,
    {
        *self.inner.filter.write() = Some(Arc::new(filter));
    }

    /// Remove the frame filter
    pub fn clear_filter(&self) {
        *self.inner.filter.write() = None;
    }

    /// Snapshot the network counters
    pub fn stats(&self) -> NetworkStats {
        let c = &self.inner.counters;
        NetworkStats {
            sent: c.sent.load(Ordering::SeqCst),
            delivered: c.delivered.load(Ordering::SeqCst),
            dropped: c.dropped.load(Ordering::SeqCst),
            duplicated: c.duplicated.load(Ordering::SeqCst),
        }
    }

    /// How many times `address` signalled a completed flush
    pub fn flush_count(&self, address: &Address) -> u64 {
        self.inner
            .endpoints
            .get(address)
            .map(|e| e.flushes.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl NetworkInner {
    fn route(&self, from: &Address, to: &Address, payload: Bytes) -> Result<(), TransportError> {
        let sender = self
            .endpoints
            .get(to)
            .map(|e| e.sender.clone())
            .ok_or(TransportError::UnknownRecipient(*to))?;

        self.counters.sent.fetch_add(1, Ordering::SeqCst);

        if self.partitions.read().contains(&(*from, *to)) {
            trace!("Partition drops frame {} -> {}", from, to);
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let filter = self.filter.read().clone();
        if let Some(filter) = filter {
            if !filter(from, to, &payload) {
                trace!("Filter drops frame {} -> {}", from, to);
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
        }

        let faults = self.faults.read().clone();
        let mut rng = rand::thread_rng();

        if rng.gen_bool(faults.drop_rate.clamp(0.0, 1.0)) {
            trace!("Fault injection drops frame {} -> {}", from, to);
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let copies = if rng.gen_bool(faults.duplicate_rate.clamp(0.0, 1.0)) {
            self.counters.duplicated.fetch_add(1, Ordering::SeqCst);
            2
        } else {
            1
        };

        let (min, max) = faults.latency;
        for _ in 0..copies {
            let envelope = TransportEnvelope {
                sender: *from,
                payload: payload.clone(),
            };

            let handle = tokio::runtime::Handle::try_current();
            match handle {
                Ok(handle) if max > Duration::ZERO => {
                    let min_us = min.as_micros() as u64;
                    let max_us = (max.as_micros() as u64).max(min_us);
                    let delay = Duration::from_micros(rng.gen_range(min_us..=max_us));
                    let sender = sender.clone();
                    let counters = self.counters.clone();
                    let to = *to;
                    handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        counters.record_send(&to, sender.send(envelope).is_ok());
                    });
                }
                _ => self.counters.record_send(to, sender.send(envelope).is_ok()),
            }
        }

        Ok(())
    }
}

/// A member's handle onto a [`MemoryNetwork`]
pub struct MemoryTransport {
    local: Address,
    network: Arc<NetworkInner>,
    flushes: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("local", &self.local)
            .field("closed", &self.closed)
            .finish()
    }
}

impl MemoryTransport {
    /// The address this transport sends from
    pub fn local_address(&self) -> Address {
        self.local
    }

    /// Stop sending; later sends fail with [`TransportError::Closed`]
    pub fn close(&self) {
        debug!("Closing memory transport {}", self.local);
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, recipient: &Address, payload: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        trace!(
            "Memory transport {} sending {} bytes to {}",
            self.local,
            payload.len(),
            recipient
        );

        self.network.route(&self.local, recipient, payload)
    }

    fn flush_complete(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_registration() {
        let network = MemoryNetwork::new();
        let addr = Address::localhost(1);

        let (transport, _rx) = network.endpoint(addr).unwrap();
        assert_eq!(transport.local_address(), addr);

        let result = network.endpoint(addr);
        assert!(matches!(result, Err(TransportError::AddressInUse(a)) if a == addr));
    }

    #[test]
    fn test_send_and_receive() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.endpoint(Address::localhost(1)).unwrap();
        let (_b, b_rx) = network.endpoint(Address::localhost(2)).unwrap();

        a.send(&Address::localhost(2), Bytes::from_static(b"hello"))
            .unwrap();

        let envelope = b_rx.try_recv().unwrap();
        assert_eq!(envelope.sender, Address::localhost(1));
        assert_eq!(envelope.payload, Bytes::from_static(b"hello"));
        assert_eq!(network.stats().delivered, 1);
    }

    #[test]
    fn test_unknown_recipient() {
        let network = MemoryNetwork::new();
        let (a, _rx) = network.endpoint(Address::localhost(1)).unwrap();

        let result = a.send(&Address::localhost(9), Bytes::new());
        assert_eq!(
            result,
            Err(TransportError::UnknownRecipient(Address::localhost(9)))
        );
    }

    #[test]
    fn test_partition_and_heal() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.endpoint(Address::localhost(1)).unwrap();
        let (_b, b_rx) = network.endpoint(Address::localhost(2)).unwrap();

        network.partition(Address::localhost(1), Address::localhost(2));
        a.send(&Address::localhost(2), Bytes::from_static(b"lost"))
            .unwrap();
        assert!(b_rx.try_recv().is_err());
        assert_eq!(network.stats().dropped, 1);

        network.heal(Address::localhost(1), Address::localhost(2));
        a.send(&Address::localhost(2), Bytes::from_static(b"found"))
            .unwrap();
        assert_eq!(b_rx.try_recv().unwrap().payload, Bytes::from_static(b"found"));
    }

    #[test]
    fn test_filter_drops_selected_frames() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.endpoint(Address::localhost(1)).unwrap();
        let (_b, b_rx) = network.endpoint(Address::localhost(2)).unwrap();

        network.set_filter(|_, _, payload| payload.as_ref() != b"drop-me");

        a.send(&Address::localhost(2), Bytes::from_static(b"drop-me"))
            .unwrap();
        a.send(&Address::localhost(2), Bytes::from_static(b"keep-me"))
            .unwrap();

        assert_eq!(b_rx.try_recv().unwrap().payload, Bytes::from_static(b"keep-me"));
        assert!(b_rx.try_recv().is_err());

        network.clear_filter();
        a.send(&Address::localhost(2), Bytes::from_static(b"drop-me"))
            .unwrap();
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn test_full_duplication() {
        let network = MemoryNetwork::with_faults(FaultConfig {
            duplicate_rate: 1.0,
            ..FaultConfig::default()
        });
        let (a, _a_rx) = network.endpoint(Address::localhost(1)).unwrap();
        let (_b, b_rx) = network.endpoint(Address::localhost(2)).unwrap();

        a.send(&Address::localhost(2), Bytes::from_static(b"twice"))
            .unwrap();

        assert_eq!(b_rx.len(), 2);
        assert_eq!(network.stats().duplicated, 1);
    }

    #[test]
    fn test_closed_transport_rejects_sends() {
        let network = MemoryNetwork::new();
        let (a, _rx) = network.endpoint(Address::localhost(1)).unwrap();

        a.close();
        assert_eq!(
            a.send(&Address::localhost(1), Bytes::new()),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn test_flush_complete_is_counted() {
        let network = MemoryNetwork::new();
        let (a, _rx) = network.endpoint(Address::localhost(1)).unwrap();

        a.flush_complete();
        a.flush_complete();
        assert_eq!(network.flush_count(&Address::localhost(1)), 2);
    }
}
