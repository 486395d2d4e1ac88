use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, MessageId, TransportMessageId};

/// Lifecycle of an outbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Scheduled,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// Regular messages come from the API layer; notifications from the status notifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Regular,
    Notification,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regular => f.write_str("regular"),
            Self::Notification => f.write_str("notification"),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(Self::Regular),
            "notification" => Ok(Self::Notification),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for MediaType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "document" => Ok(Self::Document),
            other => Err(format!("unknown media type: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    pub media_type: MediaType,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// A message on its way out, persisted for its whole lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessageRequest {
    pub id: MessageId,
    pub instance_id: InstanceId,
    pub recipient: String,
    pub content: String,
    pub media: Option<MediaDescriptor>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub kind: MessageKind,
    pub transport_message_id: Option<TransportMessageId>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboundMessageRequest {
    /// Content handed to the transport: the media payload when present, text otherwise.
    pub fn outbound_content(&self) -> OutboundContent {
        match &self.media {
            Some(media) => OutboundContent::Media {
                media: media.clone(),
                caption: media
                    .caption
                    .clone()
                    .or_else(|| (!self.content.is_empty()).then(|| self.content.clone())),
            },
            None => OutboundContent::Text {
                body: self.content.clone(),
            },
        }
    }

    pub fn is_notification(&self) -> bool {
        self.kind == MessageKind::Notification
    }
}

/// Fields supplied when creating a message. The store assigns id and timestamps.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub instance_id: InstanceId,
    pub recipient: String,
    pub content: String,
    #[serde(default)]
    pub media: Option<MediaDescriptor>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    #[serde(default)]
    pub kind: MessageKind,
}

/// Partial update; `None` leaves the column untouched.
#[derive(Clone, Debug, Default)]
pub struct MessageUpdate {
    pub status: Option<MessageStatus>,
    pub error_message: Option<String>,
    pub transport_message_id: Option<TransportMessageId>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl MessageUpdate {
    pub fn sent(transport_message_id: TransportMessageId, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(MessageStatus::Sent),
            transport_message_id: Some(transport_message_id),
            sent_at: Some(at),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(MessageStatus::Failed),
            error_message: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Payload passed to the transport's send call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundContent {
    Text {
        body: String,
    },
    Media {
        media: MediaDescriptor,
        caption: Option<String>,
    },
}

/// Normalize a recipient into a transport chat id.
///
/// Bare numbers keep their digits and gain the `@c.us` suffix; anything that
/// already carries a domain (`@g.us` groups, pre-formatted ids) passes through.
/// `None` when there is nothing to address: no digits, or an empty side of `@`.
pub fn chat_id_for(recipient: &str) -> Option<String> {
    let trimmed = recipient.trim();
    if let Some((user, domain)) = trimmed.split_once('@') {
        return (!user.is_empty() && !domain.is_empty()).then(|| trimmed.to_string());
    }
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    (!digits.is_empty()).then(|| format!("{digits}@c.us"))
}
