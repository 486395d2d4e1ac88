use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, MessageId, TransportMessageId};
use crate::instance::InstanceStatus;
use crate::message::MessageStatus;
use crate::rate_limit::RateLimitConfig;

/// System events pushed to observers. Wire shape is `{ "type": ..., "payload": {...} }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum SystemEvent {
    /// Full snapshot for a newly connected observer, or a single instance's
    /// state after `initialize`.
    ConnectionState(StateSnapshot),

    QrCode {
        instance_id: InstanceId,
        qr_code: String,
    },

    Authenticated {
        instance_id: InstanceId,
    },

    Ready {
        instance_id: InstanceId,
    },

    Disconnected {
        instance_id: InstanceId,
        reason: Option<String>,
    },

    AuthFailure {
        instance_id: InstanceId,
        message: String,
    },

    MessageSent {
        message_id: MessageId,
        instance_id: InstanceId,
        recipient: String,
        transport_message_id: TransportMessageId,
        scheduled: bool,
    },

    MessageSendError {
        message_id: MessageId,
        instance_id: InstanceId,
        recipient: String,
        error: String,
        scheduled: bool,
    },

    MessageStatusUpdate {
        message_id: MessageId,
        transport_message_id: TransportMessageId,
        status: MessageStatus,
    },

    ContactsRefreshed {
        instance_id: InstanceId,
        count: usize,
    },

    RateLimitUpdated(RateLimitConfig),

    QueueProgress {
        batch: u32,
        message_id: MessageId,
        succeeded: bool,
        sent: u32,
        failed: u32,
        remaining: usize,
    },

    QueueBatchPause {
        batch: u32,
        delay_ms: u64,
        remaining: usize,
    },

    QueueComplete {
        batches: u32,
        sent: u32,
        failed: u32,
    },

    QueueError {
        error: String,
        remaining: usize,
    },
}

/// Current state handed to an observer at connection time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub instances: Vec<InstanceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
}

impl SystemEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionState(_) => "CONNECTION_STATE",
            Self::QrCode { .. } => "QR_CODE",
            Self::Authenticated { .. } => "AUTHENTICATED",
            Self::Ready { .. } => "READY",
            Self::Disconnected { .. } => "DISCONNECTED",
            Self::AuthFailure { .. } => "AUTH_FAILURE",
            Self::MessageSent { .. } => "MESSAGE_SENT",
            Self::MessageSendError { .. } => "MESSAGE_SEND_ERROR",
            Self::MessageStatusUpdate { .. } => "MESSAGE_STATUS_UPDATE",
            Self::ContactsRefreshed { .. } => "CONTACTS_REFRESHED",
            Self::RateLimitUpdated(_) => "RATE_LIMIT_UPDATED",
            Self::QueueProgress { .. } => "QUEUE_PROGRESS",
            Self::QueueBatchPause { .. } => "QUEUE_BATCH_PAUSE",
            Self::QueueComplete { .. } => "QUEUE_COMPLETE",
            Self::QueueError { .. } => "QUEUE_ERROR",
        }
    }

    /// The instance an event concerns, if it is instance-scoped.
    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            Self::QrCode { instance_id, .. }
            | Self::Authenticated { instance_id }
            | Self::Ready { instance_id }
            | Self::Disconnected { instance_id, .. }
            | Self::AuthFailure { instance_id, .. }
            | Self::MessageSent { instance_id, .. }
            | Self::MessageSendError { instance_id, .. }
            | Self::ContactsRefreshed { instance_id, .. } => Some(instance_id),
            _ => None,
        }
    }
}
