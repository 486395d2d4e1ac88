//! Per-instance connection state machine.
//!
//! Each instance owns a transport driver and an event pump task that feeds
//! driver events back into the manager. The in-memory record is the source
//! of truth; every change is mirrored to the instance store.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use herald_core::errors::{ConnectionError, SendError, TransportError};
use herald_core::events::{StateSnapshot, SystemEvent};
use herald_core::ids::{InstanceId, TransportMessageId};
use herald_core::instance::{ConnectionState, InstanceStatus, MessagingInstance};
use herald_core::message::{chat_id_for, OutboundMessageRequest};
use herald_core::transport::{AckLevel, TransportDriver, TransportEvent, TransportFactory};
use herald_store::{InstanceStore, MessageStore};

use crate::broadcast::Broadcaster;
use crate::queue::{MessageSender, SendResult};

struct InstanceSlot {
    record: MessagingInstance,
    driver: Option<Arc<dyn TransportDriver>>,
    pump: Option<JoinHandle<()>>,
}

impl InstanceSlot {
    fn idle(record: MessagingInstance) -> Self {
        Self {
            record,
            driver: None,
            pump: None,
        }
    }

    fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.driver = None;
    }
}

/// Owns every instance record and its transport driver.
pub struct InstanceManager {
    slots: DashMap<InstanceId, InstanceSlot>,
    instances: Arc<dyn InstanceStore>,
    messages: Arc<dyn MessageStore>,
    factory: Arc<dyn TransportFactory>,
    broadcaster: Broadcaster,
    event_buffer: usize,
}

impl InstanceManager {
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        messages: Arc<dyn MessageStore>,
        factory: Arc<dyn TransportFactory>,
        broadcaster: Broadcaster,
        event_buffer: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
            instances,
            messages,
            factory,
            broadcaster,
            event_buffer: event_buffer.max(1),
        })
    }

    /// Load persisted instances. Nothing is connected after a restart, so
    /// records left mid-handshake or ready come back as disconnected.
    pub fn restore(&self) -> Result<usize, ConnectionError> {
        let records = self
            .instances
            .list_instances()
            .map_err(|e| ConnectionError::Store(e.to_string()))?;
        let count = records.len();

        for mut record in records {
            let state = record.connection_state;
            if state.is_initialized() {
                record.connection_state = ConnectionState::Disconnected;
                record.qr_code = None;
                record.updated_at = Utc::now();
                self.persist(&record);
                debug!(instance_id = %record.id, previous = %state, "restored as disconnected");
            }
            self.slots.insert(record.id.clone(), InstanceSlot::idle(record));
        }

        info!(count, "instances restored");
        Ok(count)
    }

    /// Create a new, uninitialized instance.
    pub fn register_instance(
        &self,
        phone_number: &str,
        display_name: &str,
    ) -> Result<MessagingInstance, ConnectionError> {
        let record = MessagingInstance::new(phone_number.trim(), display_name.trim());
        self.instances
            .create_instance(&record)
            .map_err(|e| ConnectionError::Store(e.to_string()))?;
        info!(instance_id = %record.id, phone_number = %record.phone_number, "instance registered");
        self
            .slots
            .insert(record.id.clone(), InstanceSlot::idle(record.clone()));
        Ok(record)
    }

    /// Start the transport handshake for an instance.
    ///
    /// A no-op while the instance is handshaking or ready. A driver that fails
    /// to start leaves the instance disconnected with `last_error` set; that
    /// failure is broadcast rather than returned.
    pub async fn initialize(
        self: &Arc<Self>,
        instance_id: &InstanceId,
    ) -> Result<InstanceStatus, ConnectionError> {
        let (driver, record) = {
            let mut slot = self
                .slots
                .get_mut(instance_id)
                .ok_or_else(|| ConnectionError::UnknownInstance(instance_id.clone()))?;

            let state = slot.record.connection_state;
            if state.is_initialized() {
                debug!(instance_id = %instance_id, state = %state, "already initialized, skipping");
                return Ok(slot.record.status());
            }
            if !state.can_transition_to(ConnectionState::Initializing) {
                return Err(ConnectionError::IllegalTransition {
                    from: state,
                    to: ConnectionState::Initializing,
                });
            }

            slot.stop();
            let (tx, rx) = mpsc::channel(self.event_buffer);
            let driver = self.factory.create(instance_id, tx);
            slot.driver = Some(Arc::clone(&driver));
            slot.pump = Some(self.spawn_pump(instance_id.clone(), rx));

            slot.record.connection_state = ConnectionState::Initializing;
            slot.record.qr_code = None;
            slot.record.last_error = None;
            slot.record.updated_at = Utc::now();
            (driver, slot.record.clone())
        };

        self.persist(&record);
        info!(instance_id = %instance_id, "initializing instance");
        self
            .broadcaster
            .broadcast(SystemEvent::ConnectionState(StateSnapshot {
                instances: vec![record.status()],
                ..Default::default()
            }));

        if let Err(e) = driver.initialize().await {
            let err = ConnectionError::Initialization(e.to_string());
            warn!(
                instance_id = %instance_id,
                error = %err,
                error_kind = err.error_kind(),
                "transport failed to start"
            );
            let reason = err.to_string();
            let moved = self.transition(instance_id, ConnectionState::Disconnected, |record| {
                record.qr_code = None;
                record.last_error = Some(reason.clone());
            });
            if moved.is_some() {
                self.broadcaster.broadcast(SystemEvent::Disconnected {
                    instance_id: instance_id.clone(),
                    reason: Some(reason),
                });
            }
        }

        self.status(instance_id)
    }

    pub fn status(&self, instance_id: &InstanceId) -> Result<InstanceStatus, ConnectionError> {
        self.slots
            .get(instance_id)
            .map(|slot| slot.record.status())
            .ok_or_else(|| ConnectionError::UnknownInstance(instance_id.clone()))
    }

    /// The pending QR payload, if the instance is waiting on a scan.
    pub fn qr_code(&self, instance_id: &InstanceId) -> Result<Option<String>, ConnectionError> {
        self.slots
            .get(instance_id)
            .map(|slot| slot.record.qr_code.clone())
            .ok_or_else(|| ConnectionError::UnknownInstance(instance_id.clone()))
    }

    /// Every known instance, oldest first.
    pub fn list_instances(&self) -> Vec<MessagingInstance> {
        let mut records: Vec<_> = self.slots.iter().map(|s| s.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn statuses(&self) -> Vec<InstanceStatus> {
        self.list_instances().iter().map(MessagingInstance::status).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stop every event pump and drop the drivers. Records are left as they are.
    pub fn shutdown(&self) {
        for mut slot in self.slots.iter_mut() {
            slot.stop();
        }
        info!(instances = self.slots.len(), "instance manager shut down");
    }

    fn spawn_pump(
        self: &Arc<Self>,
        instance_id: InstanceId,
        mut rx: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_event(&instance_id, event);
            }
            debug!(instance_id = %instance_id, "event pump stopped");
        })
    }

    /// Apply one transport event to an instance.
    pub(crate) fn handle_event(&self, instance_id: &InstanceId, event: TransportEvent) {
        debug!(instance_id = %instance_id, event = event.name(), "transport event");

        match event {
            TransportEvent::Qr { qr } => {
                let awaiting = self
                    .slots
                    .get(instance_id)
                    .is_some_and(|s| s.record.connection_state == ConnectionState::AwaitingQrScan);
                let qr_for_record = qr.clone();
                let updated = if awaiting {
                    self.modify(instance_id, |record| record.qr_code = Some(qr_for_record))
                } else {
                    self.transition(instance_id, ConnectionState::AwaitingQrScan, |record| {
                        record.qr_code = Some(qr_for_record);
                    })
                };
                if updated.is_some() {
                    self.broadcaster.broadcast(SystemEvent::QrCode {
                        instance_id: instance_id.clone(),
                        qr_code: qr,
                    });
                }
            }
            TransportEvent::Authenticated => {
                if self.modify(instance_id, |record| record.qr_code = None).is_some() {
                    info!(instance_id = %instance_id, "instance authenticated");
                    self.broadcaster.broadcast(SystemEvent::Authenticated {
                        instance_id: instance_id.clone(),
                    });
                }
            }
            TransportEvent::Ready => {
                let now = Utc::now();
                let moved = self.transition(instance_id, ConnectionState::Ready, |record| {
                    record.qr_code = None;
                    record.last_error = None;
                    record.last_connected_at = Some(now);
                });
                if moved.is_some() {
                    info!(instance_id = %instance_id, "instance ready");
                    self.broadcaster.broadcast(SystemEvent::Ready {
                        instance_id: instance_id.clone(),
                    });
                    self.refresh_contacts(instance_id);
                }
            }
            TransportEvent::Disconnected { reason } => {
                let moved = self.transition(instance_id, ConnectionState::Disconnected, |record| {
                    record.qr_code = None;
                });
                if moved.is_some() {
                    warn!(instance_id = %instance_id, reason = ?reason, "instance disconnected");
                    self.broadcaster.broadcast(SystemEvent::Disconnected {
                        instance_id: instance_id.clone(),
                        reason,
                    });
                }
            }
            TransportEvent::AuthFailure { message } => {
                let err = ConnectionError::Authentication(message.clone());
                let moved = self.transition(instance_id, ConnectionState::AuthFailure, |record| {
                    record.qr_code = None;
                    record.last_error = Some(err.to_string());
                });
                if moved.is_some() {
                    warn!(
                        instance_id = %instance_id,
                        error = %err,
                        error_kind = err.error_kind(),
                        "authentication failed"
                    );
                    self.broadcaster.broadcast(SystemEvent::AuthFailure {
                        instance_id: instance_id.clone(),
                        message,
                    });
                }
            }
            TransportEvent::MessageAck {
                transport_message_id,
                ack,
            } => self.apply_ack(instance_id, &transport_message_id, ack),
        }
    }

    fn apply_ack(&self, instance_id: &InstanceId, transport_message_id: &TransportMessageId, ack: AckLevel) {
        let Some(status) = ack.message_status() else {
            return;
        };
        match self
            .messages
            .update_status_by_transport_id(transport_message_id, status)
        {
            Ok(Some(message)) => {
                debug!(
                    instance_id = %instance_id,
                    message_id = %message.id,
                    status = %status,
                    "delivery status updated"
                );
                self.broadcaster.broadcast(SystemEvent::MessageStatusUpdate {
                    message_id: message.id,
                    transport_message_id: transport_message_id.clone(),
                    status,
                });
            }
            Ok(None) => {
                debug!(
                    instance_id = %instance_id,
                    transport_message_id = %transport_message_id,
                    "ack ignored"
                );
            }
            Err(e) => {
                warn!(
                    instance_id = %instance_id,
                    transport_message_id = %transport_message_id,
                    error = %e,
                    "failed to record delivery ack"
                );
            }
        }
    }

    fn refresh_contacts(&self, instance_id: &InstanceId) {
        let Some(driver) = self.slots.get(instance_id).and_then(|s| s.driver.clone()) else {
            return;
        };
        let broadcaster = self.broadcaster.clone();
        let instance_id = instance_id.clone();
        tokio::spawn(async move {
            match driver.get_contacts().await {
                Ok(contacts) => {
                    info!(instance_id = %instance_id, count = contacts.len(), "contacts refreshed");
                    broadcaster.broadcast(SystemEvent::ContactsRefreshed {
                        instance_id,
                        count: contacts.len(),
                    });
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "contact refresh failed");
                }
            }
        });
    }

    /// Move an instance to `to`. Illegal transitions are logged and ignored.
    fn transition<F>(
        &self,
        instance_id: &InstanceId,
        to: ConnectionState,
        mutate: F,
    ) -> Option<MessagingInstance>
    where
        F: FnOnce(&mut MessagingInstance),
    {
        let updated = {
            let Some(mut slot) = self.slots.get_mut(instance_id) else {
                warn!(instance_id = %instance_id, "event for unknown instance");
                return None;
            };
            let from = slot.record.connection_state;
            if !from.can_transition_to(to) {
                let err = ConnectionError::IllegalTransition { from, to };
                warn!(instance_id = %instance_id, error = %err, "transition rejected");
                return None;
            }
            slot.record.connection_state = to;
            mutate(&mut slot.record);
            slot.record.updated_at = Utc::now();
            slot.record.clone()
        };
        debug!(instance_id = %instance_id, state = %to, "state changed");
        self.persist(&updated);
        Some(updated)
    }

    /// Update a record without changing its state.
    fn modify<F>(&self, instance_id: &InstanceId, mutate: F) -> Option<MessagingInstance>
    where
        F: FnOnce(&mut MessagingInstance),
    {
        let updated = {
            let Some(mut slot) = self.slots.get_mut(instance_id) else {
                warn!(instance_id = %instance_id, "event for unknown instance");
                return None;
            };
            mutate(&mut slot.record);
            slot.record.updated_at = Utc::now();
            slot.record.clone()
        };
        self.persist(&updated);
        Some(updated)
    }

    fn persist(&self, record: &MessagingInstance) {
        if let Err(e) = self.instances.save_instance(record) {
            warn!(instance_id = %record.id, error = %e, "failed to persist instance");
        }
    }
}

#[async_trait]
impl MessageSender for InstanceManager {
    async fn send(&self, request: &OutboundMessageRequest) -> SendResult {
        let driver = {
            let slot = self
                .slots
                .get(&request.instance_id)
                .ok_or_else(|| SendError::UnknownInstance(request.instance_id.clone()))?;
            match (&slot.driver, slot.record.connection_state) {
                (Some(driver), ConnectionState::Ready) => Arc::clone(driver),
                (_, state) => {
                    return Err(SendError::InstanceNotReady {
                        instance_id: request.instance_id.clone(),
                        state,
                    })
                }
            }
        };

        let chat_id = chat_id_for(&request.recipient)
            .ok_or_else(|| TransportError::InvalidRecipient(request.recipient.clone()))?;
        let transport_id = driver
            .send_message(&chat_id, &request.outbound_content())
            .await?;
        Ok(transport_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBehavior, MockTransportFactory};
    use crate::test_support::{collect_events, request, wait_for, StoreFixture};
    use herald_core::errors::TransportError;
    use herald_core::message::{MessageStatus, MessageUpdate, NewMessage, OutboundContent};
    use herald_core::transport::Contact;

    struct Harness {
        fixture: StoreFixture,
        factory: Arc<MockTransportFactory>,
        manager: Arc<InstanceManager>,
        broadcaster: Broadcaster,
    }

    fn harness(behavior: MockBehavior) -> Harness {
        let fixture = StoreFixture::new();
        let factory = Arc::new(MockTransportFactory::new(behavior));
        let broadcaster = Broadcaster::new(64);
        let manager = InstanceManager::new(
            fixture.instances.clone(),
            fixture.messages.clone(),
            factory.clone(),
            broadcaster.clone(),
            16,
        );
        manager.restore().unwrap();
        Harness {
            fixture,
            factory,
            manager,
            broadcaster,
        }
    }

    fn qr_behavior() -> MockBehavior {
        MockBehavior {
            on_initialize: vec![TransportEvent::Qr { qr: "qr-1".into() }],
            contacts: vec![
                Contact {
                    id: "15550100@c.us".into(),
                    name: Some("Ana".into()),
                    number: Some("15550100".into()),
                },
                Contact {
                    id: "15550101@c.us".into(),
                    name: None,
                    number: Some("15550101".into()),
                },
            ],
            ..Default::default()
        }
    }

    /// Drive the fixture instance all the way to ready.
    async fn connect(h: &Harness) {
        let id = h.fixture.instance.id.clone();
        let mut rx = h.broadcaster.subscribe();
        h.manager.initialize(&id).await.unwrap();
        wait_for(&mut rx, "QR_CODE").await;
        h.factory.driver(&id).unwrap().emit(TransportEvent::Ready).await;
        wait_for(&mut rx, "READY").await;
        wait_for(&mut rx, "CONTACTS_REFRESHED").await;
    }

    #[tokio::test]
    async fn initialize_reaches_qr_then_ready() {
        let h = harness(qr_behavior());
        let id = h.fixture.instance.id.clone();
        let mut rx = h.broadcaster.subscribe();

        let status = h.manager.initialize(&id).await.unwrap();
        assert!(status.is_initialized);
        assert!(!status.is_connected);

        match rx.recv().await.unwrap() {
            SystemEvent::ConnectionState(snapshot) => {
                assert_eq!(snapshot.instances.len(), 1);
                assert_eq!(snapshot.instances[0].state, ConnectionState::Initializing);
            }
            other => panic!("unexpected {other:?}"),
        }
        match wait_for(&mut rx, "QR_CODE").await {
            SystemEvent::QrCode { qr_code, .. } => assert_eq!(qr_code, "qr-1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.manager.qr_code(&id).unwrap().as_deref(), Some("qr-1"));
        assert_eq!(h.manager.status(&id).unwrap().state, ConnectionState::AwaitingQrScan);

        let driver = h.factory.driver(&id).unwrap();
        driver.emit(TransportEvent::Authenticated).await;
        wait_for(&mut rx, "AUTHENTICATED").await;
        assert!(h.manager.qr_code(&id).unwrap().is_none());

        driver.emit(TransportEvent::Ready).await;
        wait_for(&mut rx, "READY").await;
        let status = h.manager.status(&id).unwrap();
        assert!(status.is_connected);
        assert_eq!(status.state, ConnectionState::Ready);

        match wait_for(&mut rx, "CONTACTS_REFRESHED").await {
            SystemEvent::ContactsRefreshed { count, .. } => assert_eq!(count, 2),
            other => panic!("unexpected {other:?}"),
        }

        // The persisted mirror follows the in-memory record.
        let stored = h.fixture.instances.get_instance(&id).unwrap();
        assert_eq!(stored.connection_state, ConnectionState::Ready);
        assert!(stored.last_connected_at.is_some());
    }

    #[tokio::test]
    async fn initialize_is_idempotent_while_handshaking() {
        let h = harness(qr_behavior());
        let id = h.fixture.instance.id.clone();
        let mut rx = h.broadcaster.subscribe();

        h.manager.initialize(&id).await.unwrap();
        wait_for(&mut rx, "QR_CODE").await;
        let status = h.manager.initialize(&id).await.unwrap();
        assert_eq!(status.state, ConnectionState::AwaitingQrScan);
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test]
    async fn initialize_on_ready_is_noop() {
        let h = harness(qr_behavior());
        connect(&h).await;
        let id = h.fixture.instance.id.clone();
        let status = h.manager.initialize(&id).await.unwrap();
        assert!(status.is_connected);
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test]
    async fn repeated_qr_refreshes_payload() {
        let h = harness(qr_behavior());
        let id = h.fixture.instance.id.clone();
        let mut rx = h.broadcaster.subscribe();
        h.manager.initialize(&id).await.unwrap();
        wait_for(&mut rx, "QR_CODE").await;

        h.factory
            .driver(&id)
            .unwrap()
            .emit(TransportEvent::Qr { qr: "qr-2".into() })
            .await;
        match wait_for(&mut rx, "QR_CODE").await {
            SystemEvent::QrCode { qr_code, .. } => assert_eq!(qr_code, "qr-2"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.manager.qr_code(&id).unwrap().as_deref(), Some("qr-2"));
        assert_eq!(h.manager.status(&id).unwrap().state, ConnectionState::AwaitingQrScan);
    }

    #[tokio::test]
    async fn driver_start_failure_is_captured() {
        let h = harness(MockBehavior {
            init_error: Some(TransportError::Request("bridge unreachable".into())),
            ..Default::default()
        });
        let id = h.fixture.instance.id.clone();
        let mut rx = h.broadcaster.subscribe();

        let status = h.manager.initialize(&id).await.unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_error.unwrap().contains("bridge unreachable"));

        match wait_for(&mut rx, "DISCONNECTED").await {
            SystemEvent::Disconnected { reason, .. } => {
                assert!(reason.unwrap().contains("bridge unreachable"));
            }
            other => panic!("unexpected {other:?}"),
        }

        // An explicit initialize is allowed again afterwards.
        let status = h.manager.initialize(&id).await.unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(h.factory.created(), 2);
    }

    #[tokio::test]
    async fn auth_failure_records_error() {
        let h = harness(qr_behavior());
        let id = h.fixture.instance.id.clone();
        let mut rx = h.broadcaster.subscribe();
        h.manager.initialize(&id).await.unwrap();
        wait_for(&mut rx, "QR_CODE").await;

        h.factory
            .driver(&id)
            .unwrap()
            .emit(TransportEvent::AuthFailure {
                message: "session revoked".into(),
            })
            .await;
        wait_for(&mut rx, "AUTH_FAILURE").await;
        let status = h.manager.status(&id).unwrap();
        assert_eq!(status.state, ConnectionState::AuthFailure);
        assert_eq!(
            status.last_error.as_deref(),
            Some("authentication failed: session revoked")
        );
        assert!(status.qr_code.is_none());
    }

    #[tokio::test]
    async fn illegal_transitions_are_noops() {
        let h = harness(qr_behavior());
        connect(&h).await;
        let id = h.fixture.instance.id.clone();
        let mut rx = h.broadcaster.subscribe();

        // Ready -> AwaitingQrScan and Ready -> AuthFailure are not in the graph.
        h.manager
            .handle_event(&id, TransportEvent::Qr { qr: "late".into() });
        h.manager.handle_event(
            &id,
            TransportEvent::AuthFailure {
                message: "late".into(),
            },
        );

        let status = h.manager.status(&id).unwrap();
        assert_eq!(status.state, ConnectionState::Ready);
        assert!(status.qr_code.is_none());
        assert!(collect_events(&mut rx).is_empty());

        // Uninitialized cannot jump to ready either.
        let other = h.manager.register_instance("+15550002", "Spare").unwrap();
        h.manager.handle_event(&other.id, TransportEvent::Ready);
        assert_eq!(
            h.manager.status(&other.id).unwrap().state,
            ConnectionState::Uninitialized
        );
    }

    #[tokio::test]
    async fn disconnect_does_not_retry() {
        let h = harness(qr_behavior());
        connect(&h).await;
        let id = h.fixture.instance.id.clone();
        let mut rx = h.broadcaster.subscribe();

        h.factory
            .driver(&id)
            .unwrap()
            .emit(TransportEvent::Disconnected {
                reason: Some("logout".into()),
            })
            .await;
        wait_for(&mut rx, "DISCONNECTED").await;
        assert_eq!(h.manager.status(&id).unwrap().state, ConnectionState::Disconnected);
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test]
    async fn send_requires_ready_instance() {
        let h = harness(qr_behavior());
        let mut req = request("+1 (555) 010-0");
        req.instance_id = h.fixture.instance.id.clone();

        match h.manager.send(&req).await {
            Err(SendError::InstanceNotReady { state, .. }) => {
                assert_eq!(state, ConnectionState::Uninitialized)
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut unknown = request("15550100");
        unknown.instance_id = InstanceId::from_raw("inst_missing");
        assert!(matches!(
            h.manager.send(&unknown).await,
            Err(SendError::UnknownInstance(_))
        ));
    }

    #[tokio::test]
    async fn send_normalizes_chat_id() {
        let h = harness(qr_behavior());
        connect(&h).await;
        let mut req = request("+1 (555) 010-0");
        req.instance_id = h.fixture.instance.id.clone();

        let transport_id = h.manager.send(&req).await.unwrap();
        assert!(transport_id.as_str().starts_with("mock_"));

        let sends = h.factory.driver(&req.instance_id).unwrap().sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].chat_id, "15550100@c.us");
        assert_eq!(
            sends[0].content,
            OutboundContent::Text {
                body: "hello +1 (555) 010-0".into()
            }
        );
    }

    #[tokio::test]
    async fn acks_update_message_status() {
        let h = harness(qr_behavior());
        connect(&h).await;
        let id = h.fixture.instance.id.clone();
        let mut rx = h.broadcaster.subscribe();

        let message = h
            .fixture
            .messages
            .create_message(&NewMessage {
                instance_id: id.clone(),
                recipient: "15550100".into(),
                content: "hi".into(),
                media: None,
                scheduled_for: None,
                status: MessageStatus::Sending,
                kind: Default::default(),
            })
            .unwrap();
        let tid = TransportMessageId::from_raw("wamid-1");
        h.fixture
            .messages
            .update_message(&message.id, &MessageUpdate::sent(tid.clone(), Utc::now()))
            .unwrap();

        let driver = h.factory.driver(&id).unwrap();
        driver
            .emit(TransportEvent::MessageAck {
                transport_message_id: tid.clone(),
                ack: AckLevel::Device,
            })
            .await;
        match wait_for(&mut rx, "MESSAGE_STATUS_UPDATE").await {
            SystemEvent::MessageStatusUpdate {
                message_id, status, ..
            } => {
                assert_eq!(message_id, message.id);
                assert_eq!(status, MessageStatus::Delivered);
            }
            other => panic!("unexpected {other:?}"),
        }

        driver
            .emit(TransportEvent::MessageAck {
                transport_message_id: tid,
                ack: AckLevel::Read,
            })
            .await;
        wait_for(&mut rx, "MESSAGE_STATUS_UPDATE").await;
        let stored = h.fixture.messages.get_message(&message.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn restore_normalizes_live_states() {
        let fixture = StoreFixture::new();
        let mut live = fixture.instance.clone();
        live.connection_state = ConnectionState::Ready;
        live.qr_code = Some("stale".into());
        fixture.instances.save_instance(&live).unwrap();

        let manager = InstanceManager::new(
            fixture.instances.clone(),
            fixture.messages.clone(),
            Arc::new(MockTransportFactory::new(MockBehavior::default())),
            Broadcaster::new(8),
            8,
        );
        assert_eq!(manager.restore().unwrap(), 1);
        let status = manager.status(&live.id).unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.qr_code.is_none());
        assert_eq!(
            fixture.instances.get_instance(&live.id).unwrap().connection_state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn register_and_list() {
        let h = harness(MockBehavior::default());
        let added = h.manager.register_instance(" +15550002 ", "Back office").unwrap();
        assert_eq!(added.phone_number, "+15550002");
        assert_eq!(added.connection_state, ConnectionState::Uninitialized);

        let listed = h.manager.list_instances();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, h.fixture.instance.id);
        assert_eq!(h.manager.statuses().len(), 2);
        assert!(h.fixture.instances.get_instance(&added.id).is_ok());
    }

    #[tokio::test]
    async fn unknown_instance_errors() {
        let h = harness(MockBehavior::default());
        let missing = InstanceId::from_raw("inst_missing");
        assert!(matches!(
            h.manager.initialize(&missing).await,
            Err(ConnectionError::UnknownInstance(_))
        ));
        assert!(h.manager.status(&missing).is_err());
        assert!(h.manager.qr_code(&missing).is_err());
    }

    #[tokio::test]
    async fn shutdown_stops_pumps() {
        let h = harness(qr_behavior());
        connect(&h).await;
        let id = h.fixture.instance.id.clone();
        let driver = h.factory.driver(&id).unwrap();

        h.manager.shutdown();
        driver
            .emit(TransportEvent::Disconnected {
                reason: Some("after shutdown".into()),
            })
            .await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.manager.status(&id).unwrap().state, ConnectionState::Ready);
    }
}
