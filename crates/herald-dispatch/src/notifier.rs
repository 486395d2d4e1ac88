//! Best-effort admin notification of send outcomes.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use herald_core::ids::MessageId;
use herald_core::message::{MessageKind, MessageStatus, MessageUpdate, NewMessage, OutboundMessageRequest};
use herald_settings::NotificationSettings;
use herald_store::MessageStore;

use crate::queue::{DispatchQueue, SendResult};

const PREVIEW_CHARS: usize = 80;

/// Sends a short summary of each outcome to the configured admin recipient
/// through the dispatch queue. Nothing here ever fails the original send.
pub struct StatusNotifier {
    settings: RwLock<NotificationSettings>,
    messages: Arc<dyn MessageStore>,
    queue: DispatchQueue,
}

impl StatusNotifier {
    pub fn new(
        settings: NotificationSettings,
        messages: Arc<dyn MessageStore>,
        queue: DispatchQueue,
    ) -> Self {
        Self {
            settings: RwLock::new(settings),
            messages,
            queue,
        }
    }

    pub fn settings(&self) -> NotificationSettings {
        self.settings.read().clone()
    }

    pub fn set_settings(&self, settings: NotificationSettings) {
        info!(
            enabled = settings.enabled,
            has_recipient = settings.admin_recipient.is_some(),
            "notification settings updated"
        );
        *self.settings.write() = settings;
    }

    /// Queue a notification about `original`. Returns the id of the queued
    /// notification, or `None` when nothing was sent.
    pub fn notify(&self, original: &OutboundMessageRequest, outcome: &SendResult) -> Option<MessageId> {
        if original.is_notification() {
            return None;
        }

        let (recipient, instance_id) = {
            let settings = self.settings.read();
            let recipient = settings.active_recipient()?.to_string();
            let instance_id = settings
                .instance_id
                .clone()
                .unwrap_or_else(|| original.instance_id.clone());
            (recipient, instance_id)
        };

        let new = NewMessage {
            instance_id,
            recipient,
            content: compose_summary(original, outcome),
            media: None,
            scheduled_for: None,
            status: MessageStatus::Sending,
            kind: MessageKind::Notification,
        };
        let record = match self.messages.create_message(&new) {
            Ok(record) => record,
            Err(e) => {
                warn!(message_id = %original.id, error = %e, "failed to create notification");
                return None;
            }
        };

        debug!(
            message_id = %original.id,
            notification_id = %record.id,
            "notification queued"
        );
        let notification_id = record.id.clone();
        let pending = self.queue.enqueue(record);
        let messages = Arc::clone(&self.messages);
        let id = notification_id.clone();
        tokio::spawn(async move {
            let update = match pending.await {
                Ok(transport_id) => MessageUpdate::sent(transport_id, Utc::now()),
                Err(e) => {
                    warn!(
                        notification_id = %id,
                        error = %e,
                        error_kind = e.error_kind(),
                        "notification send failed"
                    );
                    MessageUpdate::failed(e.to_string())
                }
            };
            if let Err(e) = messages.update_message(&id, &update) {
                warn!(notification_id = %id, error = %e, "failed to record notification outcome");
            }
        });
        Some(notification_id)
    }
}

/// Human-readable summary of a send outcome.
pub fn compose_summary(original: &OutboundMessageRequest, outcome: &SendResult) -> String {
    let label = if original.scheduled_for.is_some() {
        "Scheduled message"
    } else {
        "Message"
    };
    let headline = match outcome {
        Ok(_) => format!("{label} to {} sent.", original.recipient),
        Err(e) => format!("{label} to {} failed: {e}", original.recipient),
    };
    let body = if original.content.trim().is_empty() {
        original
            .media
            .as_ref()
            .map(|m| format!("[{}] {}", m.media_type, m.path))
            .unwrap_or_default()
    } else {
        preview(&original.content, PREVIEW_CHARS)
    };
    if body.is_empty() {
        headline
    } else {
        format!("{headline}\n> {body}")
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars).collect();
    cut.push('…');
    cut
}
