//! Shared cluster harness for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ordercast_total::{
    Delivery, Frame, HeaderKind, OrderingHeader, TotalConfig, TotalOrder, View, ViewEpoch,
};
use ordercast_transport::{Address, Transport};
use ordercast_transport_memory::{MemoryNetwork, MemoryTransport};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Timings short enough for virtual time to get through quickly
pub fn test_config() -> TotalConfig {
    TotalConfig {
        retransmit_intervals: vec![Duration::from_millis(500), Duration::from_millis(700)],
        mcast_retransmit_intervals: vec![Duration::from_millis(500), Duration::from_millis(700)],
        op_timeout: Duration::from_secs(5),
        gap_check_interval: Duration::from_millis(100),
        lock_timeout: Duration::from_secs(1),
        subgroup: None,
    }
}

pub fn addr(index: usize) -> Address {
    Address::localhost(7000 + index as u16)
}

pub struct Node {
    pub address: Address,
    pub total: TotalOrder,
    pub deliveries: flume::Receiver<Delivery>,
    pub transport: Arc<MemoryTransport>,
    receiver: JoinHandle<()>,
}

impl Node {
    /// Collect exactly `count` deliveries, failing if they take too long
    pub async fn collect(&self, count: usize) -> Vec<Delivery> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let delivery = timeout(Duration::from_secs(60), self.deliveries.recv_async())
                .await
                .unwrap_or_else(|_| {
                    panic!(
                        "{} timed out after {} of {} deliveries",
                        self.address,
                        out.len(),
                        count
                    )
                })
                .expect("delivery channel closed");
            out.push(delivery);
        }
        out
    }

    /// Assert nothing is delivered for `period`
    pub async fn assert_quiet(&self, period: Duration) {
        if let Ok(Ok(delivery)) = timeout(period, self.deliveries.recv_async()).await {
            panic!("{} unexpectedly delivered {:?}", self.address, delivery);
        }
    }

    /// Inject a raw frame as if `self` had sent it to `to`
    pub fn inject(&self, to: Address, frame: Frame) {
        self.transport.send(&to, frame.encode()).unwrap();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

pub struct Cluster {
    pub network: MemoryNetwork,
    pub nodes: Vec<Node>,
}

impl Cluster {
    /// `size` members on a fault-free network
    pub fn new(size: usize) -> Self {
        Self::on(MemoryNetwork::new(), size, test_config())
    }

    /// `size` members on `network`
    pub fn on(network: MemoryNetwork, size: usize, config: TotalConfig) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let nodes = (1..=size)
            .map(|index| {
                let address = addr(index);
                let (transport, inbound) = network.endpoint(address).unwrap();
                let transport = Arc::new(transport);
                let (total, deliveries) =
                    TotalOrder::new(config.clone(), transport.clone()).unwrap();
                total.set_local_address(address);
                let receiver = total.spawn_receiver(inbound);

                Node {
                    address,
                    total,
                    deliveries,
                    transport,
                    receiver,
                }
            })
            .collect();

        Self { network, nodes }
    }

    /// Member `index`, 1-based like the addresses
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index - 1]
    }

    /// A view over all members
    pub fn view(&self, epoch: i32) -> View {
        View::new(
            ViewEpoch::new(epoch),
            self.nodes.iter().map(|n| n.address).collect(),
        )
    }

    /// Install `view` at every member
    pub fn install(&self, view: &View) {
        for node in &self.nodes {
            node.total.view_change(view.clone());
        }
    }
}

/// Header of an encoded frame, if it decodes
pub fn header_of(payload: &Bytes) -> Option<OrderingHeader> {
    Frame::decode(payload.clone()).ok().and_then(|f| f.header)
}

/// Whether an encoded frame carries `kind`
pub fn is_kind(payload: &Bytes, kind: HeaderKind) -> bool {
    header_of(payload).is_some_and(|h| h.kind == kind)
}

pub fn payloads(deliveries: &[Delivery]) -> Vec<Bytes> {
    deliveries.iter().map(|d| d.payload.clone()).collect()
}
