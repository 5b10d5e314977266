//! Retransmission of unacknowledged sequencing requests
//!
//! Each scope owns one scheduler. An entry is retransmitted at an interval
//! picked at random from a small set of averages, so members that lost the
//! same reply do not retransmit in lockstep. The entry lives until it is
//! acknowledged or the command reports the request is gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace};

const FALLBACK_INTERVAL: Duration = Duration::from_secs(60);

/// What a retransmission attempt did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetransmitOutcome {
    /// The request went out again
    Sent,
    /// Transmission is paused; keep the timer running
    Suppressed,
    /// The request is no longer pending; forget it
    Gone,
}

/// Callback invoked with the correlation id of a due entry
pub(crate) type RetransmitCommand = Arc<dyn Fn(i64) -> RetransmitOutcome + Send + Sync>;

struct Shared {
    name: &'static str,
    intervals: Vec<Duration>,
    due: Mutex<HashMap<i64, Instant>>,
    notify: Notify,
}

impl Shared {
    fn pick_interval(&self) -> Duration {
        self.intervals
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(FALLBACK_INTERVAL)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.due.lock().values().min().copied()
    }

    fn take_due(&self, now: Instant) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .due
            .lock()
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Timer wheel for one scope's pending requests
pub(crate) struct RetransmitScheduler {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl RetransmitScheduler {
    /// Spawn the scheduler task; requires a tokio runtime
    pub(crate) fn spawn(
        name: &'static str,
        intervals: Vec<Duration>,
        command: RetransmitCommand,
    ) -> Self {
        let shared = Arc::new(Shared {
            name,
            intervals,
            due: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        });

        let task = tokio::spawn(run(shared.clone(), command));

        Self { shared, task }
    }

    /// Start retransmitting `correlation_id`
    pub(crate) fn add(&self, correlation_id: i64) {
        let at = Instant::now() + self.shared.pick_interval();
        self.shared.due.lock().insert(correlation_id, at);
        self.shared.notify.notify_one();
    }

    /// Stop retransmitting `correlation_id`
    pub(crate) fn ack(&self, correlation_id: i64) {
        self.shared.due.lock().remove(&correlation_id);
    }

    /// Forget every entry
    pub(crate) fn reset(&self) {
        self.shared.due.lock().clear();
        self.shared.notify.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.shared.due.lock().len()
    }
}

impl Drop for RetransmitScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(shared: Arc<Shared>, command: RetransmitCommand) {
    loop {
        match shared.next_deadline() {
            None => shared.notify.notified().await,
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = shared.notify.notified() => continue,
                }
            }
        }

        let now = Instant::now();
        for id in shared.take_due(now) {
            let outcome = command(id);
            let mut due = shared.due.lock();
            match outcome {
                RetransmitOutcome::Gone => {
                    trace!("{}: request {} no longer pending", shared.name, id);
                    due.remove(&id);
                }
                RetransmitOutcome::Sent | RetransmitOutcome::Suppressed => {
                    // Acked while the command ran
                    if let Some(at) = due.get_mut(&id) {
                        *at = Instant::now() + shared.pick_interval();
                    }
                }
            }
        }

        debug!("{}: {} requests awaiting ack", shared.name, shared.due.lock().len());
    }
}
