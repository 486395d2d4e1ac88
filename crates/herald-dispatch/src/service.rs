//! The process-wide messaging service: one object wiring the instance
//! manager, dispatch queue, poller, and notifier over injected stores and
//! transport.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use herald_core::clock::Clock;
use herald_core::errors::{ConnectionError, SendError};
use herald_core::events::{StateSnapshot, SystemEvent};
use herald_core::ids::{InstanceId, MessageId};
use herald_core::instance::{InstanceStatus, MessagingInstance};
use herald_core::message::{
    chat_id_for, MediaDescriptor, MessageKind, MessageStatus, NewMessage, OutboundMessageRequest,
};
use herald_core::rate_limit::{RateLimitConfig, RateLimitUpdate};
use herald_core::transport::TransportFactory;
use herald_settings::{HeraldSettings, NotificationSettings};
use herald_store::{InstanceStore, MessageStore, StoreError};

use crate::broadcast::Broadcaster;
use crate::connection::InstanceManager;
use crate::notifier::StatusNotifier;
use crate::outcome::OutcomeReporter;
use crate::poller::{PollerHandle, ScheduledPoller};
use crate::queue::{DispatchQueue, MessageSender};
use crate::rate_limit::RateLimiter;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("message {message_id} failed: {source}")]
    Send {
        message_id: MessageId,
        #[source]
        source: SendError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ServiceError {
    /// Stable code for API clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(ConnectionError::UnknownInstance(_)) => "NOT_FOUND",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Send {
                source: SendError::InstanceNotReady { .. },
                ..
            } => "INSTANCE_NOT_READY",
            Self::Send { .. } => "SEND_FAILED",
            Self::Store(StoreError::NotFound(_)) => "NOT_FOUND",
            Self::Store(_) => "STORE_ERROR",
            Self::InvalidRequest(_) => "INVALID_PARAMS",
        }
    }
}

/// A send as requested by the API layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub instance_id: InstanceId,
    pub recipient: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub media: Option<MediaDescriptor>,
}

/// Runtime knobs for [`MessagingService`].
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub rate_limit: RateLimitConfig,
    pub notifications: NotificationSettings,
    pub poll_interval: Duration,
    pub event_buffer: usize,
    pub broadcast_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_settings(&HeraldSettings::default())
    }
}

impl ServiceConfig {
    pub fn from_settings(settings: &HeraldSettings) -> Self {
        Self {
            rate_limit: settings.dispatch,
            notifications: settings.notifications.clone(),
            poll_interval: Duration::from_secs(settings.poller.interval_secs),
            event_buffer: settings.transport.event_buffer,
            broadcast_capacity: settings.server.broadcast_capacity,
        }
    }
}

/// Collaborators the service is built over.
pub struct ServiceDeps {
    pub instances: Arc<dyn InstanceStore>,
    pub messages: Arc<dyn MessageStore>,
    pub transport: Arc<dyn TransportFactory>,
    pub clock: Arc<dyn Clock>,
}

pub struct MessagingService {
    manager: Arc<InstanceManager>,
    messages: Arc<dyn MessageStore>,
    queue: DispatchQueue,
    limiter: Arc<RateLimiter>,
    notifier: Arc<StatusNotifier>,
    reporter: Arc<OutcomeReporter>,
    broadcaster: Broadcaster,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl MessagingService {
    pub fn new(deps: ServiceDeps, config: ServiceConfig) -> Self {
        let broadcaster = Broadcaster::new(config.broadcast_capacity);
        let manager = InstanceManager::new(
            deps.instances,
            Arc::clone(&deps.messages),
            deps.transport,
            broadcaster.clone(),
            config.event_buffer,
        );
        let limiter = Arc::new(RateLimiter::new(config.rate_limit, broadcaster.clone()));
        let sender: Arc<dyn MessageSender> = manager.clone();
        let queue = DispatchQueue::new(sender, Arc::clone(&limiter), broadcaster.clone());
        let notifier = Arc::new(StatusNotifier::new(
            config.notifications,
            Arc::clone(&deps.messages),
            queue.clone(),
        ));
        let reporter = Arc::new(OutcomeReporter::new(
            Arc::clone(&deps.messages),
            broadcaster.clone(),
            Arc::clone(&notifier),
            Arc::clone(&deps.clock),
        ));

        Self {
            manager,
            messages: deps.messages,
            queue,
            limiter,
            notifier,
            reporter,
            broadcaster,
            clock: deps.clock,
            poll_interval: config.poll_interval,
        }
    }

    /// Load persisted instances into the manager.
    pub fn restore(&self) -> Result<usize, ServiceError> {
        Ok(self.manager.restore()?)
    }

    pub fn register_instance(
        &self,
        phone_number: &str,
        display_name: &str,
    ) -> Result<MessagingInstance, ServiceError> {
        if phone_number.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("phoneNumber is required".into()));
        }
        Ok(self.manager.register_instance(phone_number, display_name)?)
    }

    pub async fn initialize_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<InstanceStatus, ServiceError> {
        Ok(self.manager.initialize(instance_id).await?)
    }

    pub fn instance_status(&self, instance_id: &InstanceId) -> Result<InstanceStatus, ServiceError> {
        Ok(self.manager.status(instance_id)?)
    }

    pub fn qr_code(&self, instance_id: &InstanceId) -> Result<Option<String>, ServiceError> {
        Ok(self.manager.qr_code(instance_id)?)
    }

    pub fn list_instances(&self) -> Vec<MessagingInstance> {
        self.manager.list_instances()
    }

    /// Send now, or persist for later when `scheduled_for` is in the future.
    ///
    /// An immediate send waits for the queue and returns the final record.
    /// A failed send is recorded as `failed` and returned as an error.
    #[instrument(skip(self, request), fields(instance_id = %request.instance_id))]
    pub async fn send_message(
        &self,
        request: SendRequest,
    ) -> Result<OutboundMessageRequest, ServiceError> {
        let recipient = request.recipient.trim().to_string();
        if recipient.is_empty() {
            return Err(ServiceError::InvalidRequest("recipient is required".into()));
        }
        if chat_id_for(&recipient).is_none() {
            return Err(ServiceError::InvalidRequest(format!(
                "recipient {recipient:?} is not a phone number or chat id"
            )));
        }
        if request.content.trim().is_empty() && request.media.is_none() {
            return Err(ServiceError::InvalidRequest(
                "content or media is required".into(),
            ));
        }
        self.manager.status(&request.instance_id)?;

        let scheduled_for = request.scheduled_for.filter(|at| *at > self.clock.now());
        let status = if scheduled_for.is_some() {
            MessageStatus::Scheduled
        } else {
            MessageStatus::Sending
        };
        let record = self.messages.create_message(&NewMessage {
            instance_id: request.instance_id,
            recipient,
            content: request.content,
            media: request.media,
            scheduled_for,
            status,
            kind: MessageKind::Regular,
        })?;

        if let Some(at) = scheduled_for {
            info!(message_id = %record.id, scheduled_for = %at, "message scheduled");
            return Ok(record);
        }

        debug!(message_id = %record.id, "message accepted for immediate send");
        let outcome = self.queue.enqueue(record.clone()).await;
        let updated = self.reporter.record(&record, &outcome, false);
        match outcome {
            Ok(_) => Ok(updated),
            Err(source) => Err(ServiceError::Send {
                message_id: record.id,
                source,
            }),
        }
    }

    pub fn set_rate_limit(&self, update: &RateLimitUpdate) -> RateLimitConfig {
        self.limiter.update(update)
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        self.limiter.current()
    }

    pub fn set_notification_settings(&self, settings: NotificationSettings) {
        self.notifier.set_settings(settings);
    }

    pub fn notification_settings(&self) -> NotificationSettings {
        self.notifier.settings()
    }

    /// Messages waiting in the dispatch queue.
    pub fn queue_depth(&self) -> usize {
        self.queue.pending_count()
    }

    /// Current state for a new observer.
    pub fn snapshot(&self) -> SystemEvent {
        SystemEvent::ConnectionState(StateSnapshot {
            instances: self.manager.statuses(),
            rate_limit: Some(self.limiter.current()),
            queue_depth: Some(self.queue.pending_count()),
        })
    }

    /// Subscribe to live events. The receiver is created before the snapshot
    /// is taken, so nothing between the two is lost.
    pub fn observe(&self) -> (SystemEvent, broadcast::Receiver<SystemEvent>) {
        let rx = self.broadcaster.subscribe();
        (self.snapshot(), rx)
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Start the scheduled-message poller on the configured interval.
    pub fn start_poller(&self) -> PollerHandle {
        Arc::new(self.poller()).start()
    }

    pub fn poller(&self) -> ScheduledPoller {
        ScheduledPoller::new(
            Arc::clone(&self.messages),
            self.queue.clone(),
            Arc::clone(&self.reporter),
            Arc::clone(&self.clock),
            self.poll_interval,
        )
    }

    pub fn shutdown(&self) {
        self.manager.shutdown();
        info!(queued = self.queue.pending_count(), "messaging service shut down");
    }
}
