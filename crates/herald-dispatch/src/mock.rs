//! Scripted transport for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use herald_core::errors::TransportError;
use herald_core::ids::{InstanceId, TransportMessageId};
use herald_core::message::OutboundContent;
use herald_core::transport::{
    Chat, Contact, TransportDriver, TransportEvent, TransportFactory,
};

/// How a mock driver responds.
#[derive(Clone, Debug, Default)]
pub struct MockBehavior {
    /// Events pushed into the channel when `initialize` is called.
    pub on_initialize: Vec<TransportEvent>,
    pub init_error: Option<TransportError>,
    /// Sends to these chat ids fail with the given error.
    pub failing_chats: HashMap<String, TransportError>,
    pub send_delay: Option<Duration>,
    pub contacts: Vec<Contact>,
}

#[derive(Clone, Debug)]
pub struct RecordedSend {
    pub chat_id: String,
    pub content: OutboundContent,
    pub at: Instant,
}

pub struct MockTransport {
    instance_id: InstanceId,
    events: mpsc::Sender<TransportEvent>,
    behavior: MockBehavior,
    sends: Mutex<Vec<RecordedSend>>,
    next_id: AtomicU64,
}

impl MockTransport {
    pub fn new(
        instance_id: InstanceId,
        events: mpsc::Sender<TransportEvent>,
        behavior: MockBehavior,
    ) -> Self {
        Self {
            instance_id,
            events,
            behavior,
            sends: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Push an event as if the network raised it. Returns false once nobody listens.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub fn sends(&self) -> Vec<RecordedSend> {
        self.sends.lock().clone()
    }
}

#[async_trait]
impl TransportDriver for MockTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        if let Some(err) = &self.behavior.init_error {
            return Err(err.clone());
        }
        for event in &self.behavior.on_initialize {
            if self.events.send(event.clone()).await.is_err() {
                return Err(TransportError::NotInitialized);
            }
        }
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: &str,
        content: &OutboundContent,
    ) -> Result<TransportMessageId, TransportError> {
        self.sends.lock().push(RecordedSend {
            chat_id: chat_id.to_string(),
            content: content.clone(),
            at: Instant::now(),
        });
        if let Some(delay) = self.behavior.send_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.behavior.failing_chats.get(chat_id) {
            return Err(err.clone());
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(TransportMessageId::from_raw(format!("mock_{n}")))
    }

    async fn get_contacts(&self) -> Result<Vec<Contact>, TransportError> {
        Ok(self.behavior.contacts.clone())
    }

    async fn get_chats(&self) -> Result<Vec<Chat>, TransportError> {
        Ok(self
            .behavior
            .contacts
            .iter()
            .map(|c| Chat {
                id: c.id.clone(),
                name: c.name.clone(),
                is_group: false,
                unread_count: 0,
            })
            .collect())
    }
}

/// Hands out [`MockTransport`]s and keeps the latest one per instance.
pub struct MockTransportFactory {
    behavior: Mutex<MockBehavior>,
    drivers: DashMap<InstanceId, Arc<MockTransport>>,
    created: AtomicUsize,
}

impl MockTransportFactory {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            drivers: DashMap::new(),
            created: AtomicUsize::new(0),
        }
    }

    /// Behavior for drivers created from now on.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn driver(&self, instance_id: &InstanceId) -> Option<Arc<MockTransport>> {
        self.drivers.get(instance_id).map(|d| Arc::clone(d.value()))
    }

    /// How many drivers have been created in total.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        instance_id: &InstanceId,
        events: mpsc::Sender<TransportEvent>,
    ) -> Arc<dyn TransportDriver> {
        let driver = Arc::new(MockTransport::new(
            instance_id.clone(),
            events,
            self.behavior.lock().clone(),
        ));
        self.created.fetch_add(1, Ordering::SeqCst);
        self.drivers.insert(instance_id.clone(), Arc::clone(&driver));
        driver
    }
}
