//! Periodic promotion of due scheduled messages into the dispatch queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use herald_core::clock::Clock;
use herald_core::message::MessageStatus;
use herald_store::MessageStore;

use crate::outcome::OutcomeReporter;
use crate::queue::DispatchQueue;

pub struct ScheduledPoller {
    messages: Arc<dyn MessageStore>,
    queue: DispatchQueue,
    reporter: Arc<OutcomeReporter>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

/// Running poller. Dropping the handle leaves the task running; call [`stop`](Self::stop).
pub struct PollerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Cancel the ticker and wait for it to exit. In-flight sends keep going.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "poller task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl ScheduledPoller {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        queue: DispatchQueue,
        reporter: Arc<OutcomeReporter>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            messages,
            queue,
            reporter,
            clock,
            interval,
        }
    }

    /// Claim and enqueue every due message. Returns how many were enqueued.
    ///
    /// Outcomes are recorded by a task per message, so this returns as soon
    /// as everything is queued.
    pub fn tick(&self) -> usize {
        let now = self.clock.now();
        let due = match self.messages.pending_messages(now) {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "failed to load scheduled messages");
                return 0;
            }
        };
        if due.is_empty() {
            return 0;
        }
        debug!(due = due.len(), "scheduled messages due");

        let mut enqueued = 0;
        for mut request in due {
            match self.messages.claim_for_sending(&request.id) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(message_id = %request.id, "already claimed, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(message_id = %request.id, error = %e, "failed to claim scheduled message");
                    continue;
                }
            }
            request.status = MessageStatus::Sending;

            let pending = self.queue.enqueue(request.clone());
            let reporter = Arc::clone(&self.reporter);
            tokio::spawn(async move {
                let outcome = pending.await;
                reporter.record(&request, &outcome, true);
            });
            enqueued += 1;
        }

        if enqueued > 0 {
            info!(enqueued, "scheduled messages promoted");
        }
        enqueued
    }

    /// Run [`tick`](Self::tick) on a fixed interval until stopped.
    pub fn start(self: Arc<Self>) -> PollerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = self.interval.as_secs(), "scheduled poller started");
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.tick();
                    }
                }
            }
            info!("scheduled poller stopped");
        });
        PollerHandle { cancel, task }
    }
}
