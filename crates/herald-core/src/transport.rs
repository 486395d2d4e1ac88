use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::ids::{InstanceId, TransportMessageId};
use crate::message::{MessageStatus, OutboundContent};

/// Lifecycle and delivery events raised by a transport driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TransportEvent {
    Qr {
        qr: String,
    },
    Authenticated,
    Ready,
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
    AuthFailure {
        message: String,
    },
    MessageAck {
        transport_message_id: TransportMessageId,
        ack: AckLevel,
    },
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Qr { .. } => "qr",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::Disconnected { .. } => "disconnected",
            Self::AuthFailure { .. } => "auth_failure",
            Self::MessageAck { .. } => "message_ack",
        }
    }
}

/// Delivery acknowledgement level reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckLevel {
    Pending,
    Server,
    Device,
    Read,
    Played,
}

impl AckLevel {
    /// Message status an ack promotes to. Server-side acks don't change anything.
    pub fn message_status(self) -> Option<MessageStatus> {
        match self {
            Self::Pending | Self::Server => None,
            Self::Device => Some(MessageStatus::Delivered),
            Self::Read | Self::Played => Some(MessageStatus::Read),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub unread_count: u32,
}

/// An opaque connection to the messaging network for one instance.
///
/// Lifecycle events flow out through the channel handed to the factory;
/// this trait only covers the calls made into the driver.
#[async_trait]
pub trait TransportDriver: Send + Sync {
    /// Start the handshake. Returns once the driver has started; readiness
    /// is reported later as a `TransportEvent::Ready`.
    async fn initialize(&self) -> Result<(), TransportError>;

    async fn send_message(
        &self,
        chat_id: &str,
        content: &OutboundContent,
    ) -> Result<TransportMessageId, TransportError>;

    async fn get_contacts(&self) -> Result<Vec<Contact>, TransportError>;

    async fn get_chats(&self) -> Result<Vec<Chat>, TransportError>;
}

/// Builds a driver bound to an instance and its event channel.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        instance_id: &InstanceId,
        events: mpsc::Sender<TransportEvent>,
    ) -> Arc<dyn TransportDriver>;
}
