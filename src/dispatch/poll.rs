//! Poll cycle
//!
//! A poll pass reads one batch from every candidate queue of every forwarder
//! with spare capacity and hands the messages over. Passes are single-flight:
//! a trigger arriving while a pass runs only sets the rerun flag, which the
//! running cycle honours before it ends.

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::MessageForwarder;
use crate::forwarder::Forwarder;
use crate::queue::QueueError;

#[derive(Debug, Default)]
struct CycleState {
    running: bool,
    rerun: bool,
}

/// Single-flight state of the poll cycle
#[derive(Debug, Default)]
pub struct PollCycle {
    state: Mutex<CycleState>,
}

impl PollCycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the cycle
    ///
    /// Returns `false` when a cycle is already running; the trigger is then
    /// absorbed into its rerun flag.
    pub fn try_begin(&self) -> bool {
        let mut state = self.state.lock();
        if state.running {
            state.rerun = true;
            false
        } else {
            state.running = true;
            true
        }
    }

    /// End of a pass that found nothing
    ///
    /// Returns `true` if a trigger arrived meanwhile and one more pass must run;
    /// otherwise the cycle ends.
    pub fn finish_or_rerun(&self) -> bool {
        let mut state = self.state.lock();
        if state.rerun {
            state.rerun = false;
            true
        } else {
            state.running = false;
            false
        }
    }

    /// End the cycle after a failure; a fresh trigger is scheduled separately
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.rerun = false;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

/// A queue read scheduled by a pass
struct Read {
    forwarder: Arc<dyn Forwarder>,
    queue_id: String,
}

impl MessageForwarder {
    /// Run passes until the candidate queues are drained or a read fails
    pub(super) async fn run_cycle(self: Arc<Self>) {
        loop {
            match self.poll_pass().await {
                Ok(true) => continue,
                Ok(false) => {
                    if !self.cycle.finish_or_rerun() {
                        trace!("Poll cycle finished");
                        break;
                    }
                }
                Err((queue_id, e)) => {
                    self.cycle.abort();
                    self.metrics.poll_read_failed();
                    warn!(
                        "Poll cycle: read of queue '{}' failed: {}, retrying in {:?}",
                        queue_id, e, self.config.poll_retry_delay
                    );
                    // Retry goes through the ordered executor, never recursing here
                    let _ = self.retry_tx.send(());
                    break;
                }
            }
        }
    }

    /// One pass over the candidate set
    ///
    /// Returns whether any read produced messages.
    async fn poll_pass(&self) -> Result<bool, (String, QueueError)> {
        self.metrics.poll_pass();

        let reads = self.schedule_reads();
        if reads.is_empty() {
            return Ok(false);
        }
        trace!("Poll pass: reading {} queues", reads.len());

        let batch = self.config.read_batch_size;
        let bytes = self.config.read_batch_bytes;
        let results = join_all(reads.into_iter().map(|read| async move {
            let result = self.queue.read(&read.queue_id, batch, bytes).await;
            (read, result)
        }))
        .await;

        let mut found = false;
        let mut failure = None;
        for (read, result) in results {
            match result {
                // Confirmed empty: stays out of the candidate set
                Ok(messages) if messages.is_empty() => {}
                Ok(messages) => {
                    found = true;
                    self.candidates.insert(read.queue_id.clone());
                    trace!(
                        "Poll pass: {} messages from '{}' to forwarder '{}'",
                        messages.len(),
                        read.queue_id,
                        read.forwarder.id()
                    );
                    for message in messages {
                        read.forwarder.on_message(message, &read.queue_id);
                    }
                }
                Err(e) => {
                    self.candidates.insert(read.queue_id.clone());
                    failure.get_or_insert((read.queue_id, e));
                }
            }
        }

        match failure {
            Some(failure) => Err(failure),
            None => Ok(found),
        }
    }

    /// Take the candidate queues of every forwarder ready to receive
    fn schedule_reads(&self) -> Vec<Read> {
        let threshold = self.config.inflight_threshold;
        let mut reads = Vec::new();

        for entry in self.forwarders.iter() {
            let registration = entry.value();
            let forwarder = &registration.forwarder;
            if forwarder.is_paused()
                || forwarder.is_buffer_full()
                || forwarder.network_inflight_count() > threshold
            {
                continue;
            }

            for queue_id in &registration.queue_ids {
                if self.candidates.remove(queue_id).is_some() {
                    reads.push(Read {
                        forwarder: forwarder.clone(),
                        queue_id: queue_id.clone(),
                    });
                }
            }
        }

        reads
    }
}
