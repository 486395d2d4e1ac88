use chrono::{DateTime, Utc};

use herald_core::ids::{InstanceId, MessageId, TransportMessageId};
use herald_core::instance::MessagingInstance;
use herald_core::message::{MessageStatus, MessageUpdate, NewMessage, OutboundMessageRequest};

use crate::error::StoreError;

/// Persistence for outbound messages.
pub trait MessageStore: Send + Sync {
    fn create_message(&self, new: &NewMessage) -> Result<OutboundMessageRequest, StoreError>;

    fn get_message(&self, id: &MessageId) -> Result<OutboundMessageRequest, StoreError>;

    /// Apply a partial update and return the updated row.
    fn update_message(
        &self,
        id: &MessageId,
        update: &MessageUpdate,
    ) -> Result<OutboundMessageRequest, StoreError>;

    /// Scheduled messages whose `scheduled_for` is at or before `now`, oldest first.
    fn pending_messages(&self, now: DateTime<Utc>)
        -> Result<Vec<OutboundMessageRequest>, StoreError>;

    /// Move a message from `scheduled` to `sending`. Returns false when another
    /// caller already claimed it.
    fn claim_for_sending(&self, id: &MessageId) -> Result<bool, StoreError>;

    /// Promote the delivery status of the message with this transport id.
    /// Returns the updated row, or `None` if nothing matched or the status
    /// would move backwards.
    fn update_status_by_transport_id(
        &self,
        transport_message_id: &TransportMessageId,
        status: MessageStatus,
    ) -> Result<Option<OutboundMessageRequest>, StoreError>;
}

/// Persistent mirror of instance records.
pub trait InstanceStore: Send + Sync {
    fn create_instance(&self, instance: &MessagingInstance) -> Result<(), StoreError>;

    fn get_instance(&self, id: &InstanceId) -> Result<MessagingInstance, StoreError>;

    fn list_instances(&self) -> Result<Vec<MessagingInstance>, StoreError>;

    fn save_instance(&self, instance: &MessagingInstance) -> Result<(), StoreError>;
}
