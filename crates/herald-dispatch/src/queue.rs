//! Rate-limited outbound dispatch queue.
//!
//! A single consumer loop drains a FIFO buffer in batches. Inside a batch it
//! waits `delay_between_messages` between sends; between batches it waits
//! `delay_between_batches`. The loop exits when the buffer is empty and the
//! next `enqueue` starts a new one. The rate-limit config is read once when a
//! loop starts, so updates only affect later runs.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use herald_core::errors::SendError;
use herald_core::events::SystemEvent;
use herald_core::ids::TransportMessageId;
use herald_core::message::OutboundMessageRequest;

use crate::broadcast::Broadcaster;
use crate::rate_limit::RateLimiter;

pub type SendResult = Result<TransportMessageId, SendError>;

/// The send target the queue dispatches into.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, request: &OutboundMessageRequest) -> SendResult;
}

struct QueueEntry {
    request: OutboundMessageRequest,
    completion: oneshot::Sender<SendResult>,
}

#[derive(Default)]
struct QueueState {
    buffer: VecDeque<QueueEntry>,
    running: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    sender: Arc<dyn MessageSender>,
    limiter: Arc<RateLimiter>,
    broadcaster: Broadcaster,
}

/// Handle to the process-wide dispatch queue. Cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

/// Resolves once the enqueued message has been sent or has failed.
#[must_use = "the send outcome is only observable by awaiting this"]
pub struct PendingDispatch {
    inner: BoxFuture<'static, SendResult>,
}

impl Future for PendingDispatch {
    type Output = SendResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl DispatchQueue {
    pub fn new(
        sender: Arc<dyn MessageSender>,
        limiter: Arc<RateLimiter>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                sender,
                limiter,
                broadcaster,
            }),
        }
    }

    /// Queue a message for sending. With rate limiting disabled the returned
    /// future calls the sender directly instead.
    pub fn enqueue(&self, request: OutboundMessageRequest) -> PendingDispatch {
        if !self.inner.limiter.current().enabled {
            debug!(message_id = %request.id, "rate limiting disabled, sending directly");
            let sender = Arc::clone(&self.inner.sender);
            return PendingDispatch {
                inner: async move { sender.send(&request).await }.boxed(),
            };
        }

        let (tx, rx) = oneshot::channel();
        let message_id = request.id.clone();
        let start = {
            let mut state = self.inner.state.lock();
            state.buffer.push_back(QueueEntry {
                request,
                completion: tx,
            });
            let start = !state.running;
            state.running = true;
            debug!(message_id = %message_id, depth = state.buffer.len(), "message enqueued");
            start
        };

        if start {
            tokio::spawn(run_loop(Arc::clone(&self.inner)));
        }

        PendingDispatch {
            // A dropped completion handle means the loop died with this entry in hand.
            inner: async move { rx.await.unwrap_or(Err(SendError::QueueAborted)) }.boxed(),
        }
    }

    /// Number of messages waiting in the buffer.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }
}

async fn run_loop(inner: Arc<QueueInner>) {
    let result = AssertUnwindSafe(drain(&inner)).catch_unwind().await;
    if let Err(panic) = result {
        let reason = panic_message(panic.as_ref());
        let remaining = {
            let mut state = inner.state.lock();
            state.running = false;
            state.buffer.len()
        };
        error!(error = %reason, remaining, "dispatch loop panicked");
        inner.broadcaster.broadcast(SystemEvent::QueueError {
            error: reason,
            remaining,
        });
    }
}

async fn drain(inner: &QueueInner) {
    let config = inner.limiter.current();
    let batch_size = config.batch_size();
    info!(
        batch_size,
        delay_between_messages = config.delay_between_messages,
        delay_between_batches = config.delay_between_batches,
        "dispatch loop started"
    );

    let mut batch: u32 = 0;
    let mut sent: u32 = 0;
    let mut failed: u32 = 0;

    loop {
        let remaining = {
            let mut state = inner.state.lock();
            if state.buffer.is_empty() {
                state.running = false;
                break;
            }
            state.buffer.len()
        };

        if batch > 0 {
            debug!(batch, remaining, delay_ms = config.delay_between_batches, "batch pause");
            inner.broadcaster.broadcast(SystemEvent::QueueBatchPause {
                batch,
                delay_ms: config.delay_between_batches,
                remaining,
            });
            tokio::time::sleep(config.batch_delay()).await;
        }
        batch += 1;

        for position in 0..batch_size {
            if position > 0 {
                if inner.state.lock().buffer.is_empty() {
                    break;
                }
                tokio::time::sleep(config.message_delay()).await;
            }

            // Entries stay buffered until their turn so a loop failure leaves them queued.
            let next = inner.state.lock().buffer.pop_front();
            let Some(QueueEntry {
                request,
                completion,
            }) = next
            else {
                break;
            };

            let result = inner.sender.send(&request).await;
            match &result {
                Ok(transport_id) => {
                    sent += 1;
                    debug!(
                        message_id = %request.id,
                        instance_id = %request.instance_id,
                        transport_message_id = %transport_id,
                        batch,
                        "message sent"
                    );
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        message_id = %request.id,
                        instance_id = %request.instance_id,
                        error = %e,
                        error_kind = e.error_kind(),
                        batch,
                        "message send failed"
                    );
                }
            }

            inner.broadcaster.broadcast(SystemEvent::QueueProgress {
                batch,
                message_id: request.id.clone(),
                succeeded: result.is_ok(),
                sent,
                failed,
                remaining: inner.state.lock().buffer.len(),
            });

            if completion.send(result).is_err() {
                debug!(message_id = %request.id, "caller dropped before completion");
            }
        }
    }

    info!(batches = batch, sent, failed, "dispatch loop finished");
    inner.broadcaster.broadcast(SystemEvent::QueueComplete {
        batches: batch,
        sent,
        failed,
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "dispatch loop panicked".to_string()
    }
}
