use std::sync::Arc;

use tracing::{info, warn};

use herald_core::clock::Clock;
use herald_core::events::SystemEvent;
use herald_core::message::{MessageStatus, MessageUpdate, OutboundMessageRequest};
use herald_store::MessageStore;

use crate::broadcast::Broadcaster;
use crate::notifier::StatusNotifier;
use crate::queue::SendResult;

/// Records a send outcome: persists it, broadcasts it, and hands it to the notifier.
pub struct OutcomeReporter {
    messages: Arc<dyn MessageStore>,
    broadcaster: Broadcaster,
    notifier: Arc<StatusNotifier>,
    clock: Arc<dyn Clock>,
}

impl OutcomeReporter {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        broadcaster: Broadcaster,
        notifier: Arc<StatusNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            messages,
            broadcaster,
            notifier,
            clock,
        }
    }

    /// Returns the updated record. If the store write fails the update is
    /// applied to a copy of `request` instead.
    pub fn record(
        &self,
        request: &OutboundMessageRequest,
        outcome: &SendResult,
        scheduled: bool,
    ) -> OutboundMessageRequest {
        let update = match outcome {
            Ok(transport_id) => MessageUpdate::sent(transport_id.clone(), self.clock.now()),
            Err(e) => MessageUpdate::failed(e.to_string()),
        };
        let updated = match self.messages.update_message(&request.id, &update) {
            Ok(updated) => updated,
            Err(e) => {
                warn!(message_id = %request.id, error = %e, "failed to persist send outcome");
                apply_locally(request.clone(), update, self.clock.as_ref())
            }
        };

        let event = match outcome {
            Ok(transport_id) => {
                info!(
                    message_id = %request.id,
                    instance_id = %request.instance_id,
                    transport_message_id = %transport_id,
                    scheduled,
                    "message sent"
                );
                SystemEvent::MessageSent {
                    message_id: request.id.clone(),
                    instance_id: request.instance_id.clone(),
                    recipient: request.recipient.clone(),
                    transport_message_id: transport_id.clone(),
                    scheduled,
                }
            }
            Err(e) => {
                warn!(
                    message_id = %request.id,
                    instance_id = %request.instance_id,
                    error = %e,
                    error_kind = e.error_kind(),
                    scheduled,
                    "message failed"
                );
                SystemEvent::MessageSendError {
                    message_id: request.id.clone(),
                    instance_id: request.instance_id.clone(),
                    recipient: request.recipient.clone(),
                    error: e.to_string(),
                    scheduled,
                }
            }
        };
        self.broadcaster.broadcast(event);

        self.notifier.notify(request, outcome);
        updated
    }
}

fn apply_locally(
    mut request: OutboundMessageRequest,
    update: MessageUpdate,
    clock: &dyn Clock,
) -> OutboundMessageRequest {
    request.status = update.status.unwrap_or(MessageStatus::Failed);
    if update.error_message.is_some() {
        request.error_message = update.error_message;
    }
    if update.transport_message_id.is_some() {
        request.transport_message_id = update.transport_message_id;
    }
    if update.sent_at.is_some() {
        request.sent_at = update.sent_at;
    }
    request.updated_at = clock.now();
    request
}
