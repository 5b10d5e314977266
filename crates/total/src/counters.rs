//! Per-scope sequence counters

use parking_lot::Mutex;

/// A monotonically increasing id source guarded by its own mutex
///
/// The first id handed out after creation or [`reset`](Self::reset) is 1.
#[derive(Debug, Default)]
pub(crate) struct SequenceCounter {
    last: Mutex<i64>,
}

impl SequenceCounter {
    pub(crate) fn next(&self) -> i64 {
        let mut last = self.last.lock();
        *last += 1;
        *last
    }

    pub(crate) fn reset(&self) {
        *self.last.lock() = 0;
    }

    #[cfg(test)]
    pub(crate) fn current(&self) -> i64 {
        *self.last.lock()
    }
}

/// The counters of one ordering scope
#[derive(Debug, Default)]
pub(crate) struct ScopeCounters {
    /// Order ids minted while this member is the scope's sequencer
    pub(crate) order: SequenceCounter,
    /// Correlation ids of this member's requests; never reset
    pub(crate) correlation: SequenceCounter,
}
