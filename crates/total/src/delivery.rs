//! Ordered delivery buffer with bounded gap wait
//!
//! Out-of-order arrivals are parked by order id and released strictly in
//! ascending order. When the next id is missing while later ones are
//! waiting, the buffer waits up to the operation timeout and then skips the
//! missing id rather than stalling forever.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use ordercast_transport::Address;
use tokio::time::Instant;

use crate::header::NONE_ID;

/// A received message waiting for its turn
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Slot {
    pub(crate) source: Address,
    pub(crate) correlation_id: i64,
    pub(crate) payload: Bytes,
}

impl Slot {
    /// Null slots only fill an order id and are never passed up
    pub(crate) fn is_null(&self) -> bool {
        self.correlation_id == NONE_ID
    }
}

/// Outcome of offering a slot to the buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Insert {
    Accepted,
    /// Id already delivered, skipped, or already parked
    Duplicate,
}

/// What one pass of the delivery loop released
#[derive(Debug, Default)]
pub(crate) struct Drained {
    /// Slots ready for delivery, in order
    pub(crate) ready: Vec<(i64, Slot)>,
    /// Ids force-skipped after the gap timeout
    pub(crate) skipped: Vec<i64>,
}

/// Delivery buffer of one scope
#[derive(Debug)]
pub(crate) struct DeliveryBuffer {
    last_delivered: i64,
    slots: BTreeMap<i64, Slot>,
    waiting_since: Option<Instant>,
    op_timeout: Duration,
}

impl DeliveryBuffer {
    pub(crate) fn new(op_timeout: Duration) -> Self {
        Self {
            last_delivered: 0,
            slots: BTreeMap::new(),
            waiting_since: None,
            op_timeout,
        }
    }

    pub(crate) fn last_delivered(&self) -> i64 {
        self.last_delivered
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn insert(&mut self, order_id: i64, slot: Slot) -> Insert {
        if order_id <= self.last_delivered || self.slots.contains_key(&order_id) {
            return Insert::Duplicate;
        }
        self.slots.insert(order_id, slot);
        Insert::Accepted
    }

    /// Run the delivery loop at time `now`
    pub(crate) fn drain(&mut self, now: Instant) -> Drained {
        let mut drained = Drained::default();

        loop {
            let next = self.last_delivered + 1;

            if let Some(slot) = self.slots.remove(&next) {
                self.last_delivered = next;
                self.waiting_since = None;
                drained.ready.push((next, slot));
                continue;
            }

            if self.slots.is_empty() {
                self.waiting_since = None;
                break;
            }

            let since = *self.waiting_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= self.op_timeout {
                self.last_delivered = next;
                self.waiting_since = None;
                drained.skipped.push(next);
                continue;
            }

            break;
        }

        drained
    }

    /// Restart the scope at order id 1, returning everything still parked
    pub(crate) fn reset(&mut self) -> Vec<(i64, Slot)> {
        self.last_delivered = 0;
        self.waiting_since = None;
        std::mem::take(&mut self.slots).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(60_000);

    fn slot(tag: &str) -> Slot {
        Slot {
            source: Address::localhost(1),
            correlation_id: 1,
            payload: Bytes::from(tag.to_string()),
        }
    }

    fn ids(drained: &Drained) -> Vec<i64> {
        drained.ready.iter().map(|(id, _)| *id).collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut buffer = DeliveryBuffer::new(TIMEOUT);
        let now = Instant::now();

        assert_eq!(buffer.insert(1, slot("a")), Insert::Accepted);
        assert_eq!(ids(&buffer.drain(now)), vec![1]);
        assert_eq!(buffer.insert(2, slot("b")), Insert::Accepted);
        assert_eq!(ids(&buffer.drain(now)), vec![2]);
        assert_eq!(buffer.last_delivered(), 2);
    }

    #[test]
    fn test_out_of_order_arrivals_wait_for_gap() {
        let mut buffer = DeliveryBuffer::new(TIMEOUT);
        let now = Instant::now();

        buffer.insert(3, slot("c"));
        buffer.insert(2, slot("b"));
        assert!(buffer.drain(now).ready.is_empty());
        assert_eq!(buffer.len(), 2);

        buffer.insert(1, slot("a"));
        let drained = buffer.drain(now);
        assert_eq!(ids(&drained), vec![1, 2, 3]);
        assert_eq!(drained.ready[2].1.payload, Bytes::from_static(b"c"));
        assert!(drained.skipped.is_empty());
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let mut buffer = DeliveryBuffer::new(TIMEOUT);
        let now = Instant::now();

        buffer.insert(1, slot("a"));
        buffer.drain(now);

        assert_eq!(buffer.insert(1, slot("a")), Insert::Duplicate);
        assert_eq!(buffer.insert(0, slot("zero")), Insert::Duplicate);
        assert_eq!(buffer.insert(3, slot("c")), Insert::Accepted);
        assert_eq!(buffer.insert(3, slot("c-again")), Insert::Duplicate);
    }

    #[test]
    fn test_gap_is_skipped_after_timeout() {
        let mut buffer = DeliveryBuffer::new(TIMEOUT);
        let start = Instant::now();

        for id in 1..=3 {
            buffer.insert(id, slot("early"));
        }
        buffer.drain(start);

        // 4 never arrives, 5..=7 do.
        for id in 5..=7 {
            buffer.insert(id, slot("late"));
        }

        let drained = buffer.drain(start + Duration::from_millis(59_999));
        assert!(drained.ready.is_empty());
        assert!(drained.skipped.is_empty());

        let drained = buffer.drain(start + TIMEOUT);
        assert_eq!(drained.skipped, vec![4]);
        assert_eq!(ids(&drained), vec![5, 6, 7]);
        assert_eq!(buffer.last_delivered(), 7);
    }

    #[test]
    fn test_each_missing_id_gets_its_own_wait() {
        let mut buffer = DeliveryBuffer::new(TIMEOUT);
        let start = Instant::now();

        buffer.insert(3, slot("c"));
        buffer.drain(start);

        let drained = buffer.drain(start + TIMEOUT);
        assert_eq!(drained.skipped, vec![1]);
        assert!(drained.ready.is_empty());

        // The wait for id 2 starts at the skip.
        let drained = buffer.drain(start + TIMEOUT + Duration::from_millis(1));
        assert!(drained.skipped.is_empty());

        let drained = buffer.drain(start + TIMEOUT * 2);
        assert_eq!(drained.skipped, vec![2]);
        assert_eq!(ids(&drained), vec![3]);
    }

    #[test]
    fn test_progress_resets_the_wait() {
        let mut buffer = DeliveryBuffer::new(TIMEOUT);
        let start = Instant::now();

        buffer.insert(2, slot("b"));
        buffer.drain(start);

        buffer.insert(1, slot("a"));
        buffer.insert(4, slot("d"));
        let drained = buffer.drain(start + Duration::from_millis(50_000));
        assert_eq!(ids(&drained), vec![1, 2]);

        // Waiting for 3 began at 50s, not at the start.
        let drained = buffer.drain(start + Duration::from_millis(100_000));
        assert!(drained.skipped.is_empty());
        let drained = buffer.drain(start + Duration::from_millis(110_000));
        assert_eq!(drained.skipped, vec![3]);
        assert_eq!(ids(&drained), vec![4]);
    }

    #[test]
    fn test_empty_buffer_never_skips() {
        let mut buffer = DeliveryBuffer::new(TIMEOUT);
        let start = Instant::now();

        let drained = buffer.drain(start + TIMEOUT * 10);
        assert!(drained.skipped.is_empty());
        assert_eq!(buffer.last_delivered(), 0);
    }

    #[test]
    fn test_reset_returns_parked_slots() {
        let mut buffer = DeliveryBuffer::new(TIMEOUT);
        let now = Instant::now();

        buffer.insert(1, slot("a"));
        buffer.drain(now);
        buffer.insert(3, slot("c"));
        buffer.insert(5, slot("e"));

        let leftovers = buffer.reset();
        assert_eq!(
            leftovers.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![3, 5]
        );
        assert_eq!(buffer.last_delivered(), 0);
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.insert(1, slot("fresh")), Insert::Accepted);
    }

    #[test]
    fn test_null_slot_detection() {
        let mut null = slot("n");
        null.correlation_id = NONE_ID;
        assert!(null.is_null());
        assert!(!slot("x").is_null());
    }
}
