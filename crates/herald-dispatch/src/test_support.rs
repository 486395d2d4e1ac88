//! Shared fixtures for the crate's unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use herald_core::errors::{SendError, TransportError};
use herald_core::events::SystemEvent;
use herald_core::ids::{InstanceId, MessageId, TransportMessageId};
use herald_core::instance::MessagingInstance;
use herald_core::message::{MessageKind, MessageStatus, OutboundMessageRequest};
use herald_store::{Database, InstanceRepo, InstanceStore, MessageRepo};

use crate::queue::{MessageSender, SendResult};

/// Sender that records every call with its (paused-clock) timestamp.
#[derive(Default)]
pub struct RecordingSender {
    sends: Mutex<Vec<(String, Instant)>>,
    failures: Mutex<HashMap<String, TransportError>>,
    panics: Mutex<HashSet<String>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingSender {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Default::default()
        }
    }

    pub fn fail(&self, recipient: &str, error: TransportError) {
        self.failures.lock().insert(recipient.to_string(), error);
    }

    pub fn panic_on(&self, recipient: &str) {
        self.panics.lock().insert(recipient.to_string());
    }

    pub fn sends(&self) -> Vec<(String, Instant)> {
        self.sends.lock().clone()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.sends.lock().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, request: &OutboundMessageRequest) -> SendResult {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        self.sends
            .lock()
            .push((request.recipient.clone(), Instant::now()));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panics.lock().contains(&request.recipient) {
            panic!("sender exploded on {}", request.recipient);
        }
        if let Some(err) = self.failures.lock().get(&request.recipient) {
            return Err(SendError::Transport(err.clone()));
        }
        Ok(TransportMessageId::from_raw(format!("t_{}", request.recipient)))
    }
}

/// An in-flight request for an arbitrary instance.
pub fn request(recipient: &str) -> OutboundMessageRequest {
    let now = Utc::now();
    OutboundMessageRequest {
        id: MessageId::new(),
        instance_id: InstanceId::from_raw("inst_test"),
        recipient: recipient.to_string(),
        content: format!("hello {recipient}"),
        media: None,
        scheduled_for: None,
        status: MessageStatus::Sending,
        error_message: None,
        kind: MessageKind::Regular,
        transport_message_id: None,
        sent_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Drain whatever is buffered on a receiver without waiting.
pub fn collect_events(rx: &mut broadcast::Receiver<SystemEvent>) -> Vec<SystemEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Wait until an event of `event_type` arrives, skipping others.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<SystemEvent>,
    event_type: &str,
) -> SystemEvent {
    let fut = async {
        loop {
            match rx.recv().await {
                Ok(event) if event.event_type() == event_type => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(600), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {event_type}"))
}

/// In-memory repos sharing one database, with a single registered instance.
pub struct StoreFixture {
    pub db: Database,
    pub instances: Arc<InstanceRepo>,
    pub messages: Arc<MessageRepo>,
    pub instance: MessagingInstance,
}

impl StoreFixture {
    pub fn new() -> Self {
        let db = Database::in_memory().unwrap();
        let instances = Arc::new(InstanceRepo::new(db.clone()));
        let messages = Arc::new(MessageRepo::new(db.clone()));
        let instance = MessagingInstance::new("+15550001", "Front desk");
        instances.create_instance(&instance).unwrap();
        Self {
            db,
            instances,
            messages,
            instance,
        }
    }
}
