//! Outstanding sequencing requests

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

/// A message waiting for its order id
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PendingRequest {
    pub(crate) correlation_id: i64,
    pub(crate) payload: Bytes,
    /// Target subgroup, `None` for broadcasts
    pub(crate) subgroup: Option<String>,
}

/// Pending requests of one scope, keyed by correlation id
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: RwLock<HashMap<i64, PendingRequest>>,
}

impl PendingTable {
    pub(crate) fn insert(&self, request: PendingRequest) {
        self.entries.write().insert(request.correlation_id, request);
    }

    /// Remove and return the entry; a second call for the same id yields `None`
    pub(crate) fn take(&self, correlation_id: i64) -> Option<PendingRequest> {
        self.entries.write().remove(&correlation_id)
    }

    pub(crate) fn get(&self, correlation_id: i64) -> Option<PendingRequest> {
        self.entries.read().get(&correlation_id).cloned()
    }

    /// Correlation ids in ascending order
    pub(crate) fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.entries.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: i64) -> PendingRequest {
        PendingRequest {
            correlation_id: id,
            payload: Bytes::from(format!("msg-{id}")),
            subgroup: None,
        }
    }

    #[test]
    fn test_take_removes_exactly_once() {
        let table = PendingTable::default();
        table.insert(request(5));

        assert_eq!(table.get(5), Some(request(5)));
        assert_eq!(table.take(5), Some(request(5)));
        assert_eq!(table.take(5), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_ids_are_sorted() {
        let table = PendingTable::default();
        for id in [9, 2, 5] {
            table.insert(request(id));
        }
        assert_eq!(table.ids(), vec![2, 5, 9]);

        table.clear();
        assert!(table.ids().is_empty());
    }
}
