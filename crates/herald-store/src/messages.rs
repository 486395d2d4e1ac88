use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use herald_core::ids::{InstanceId, MessageId, TransportMessageId};
use herald_core::message::{
    MediaDescriptor, MessageStatus, MessageUpdate, NewMessage, OutboundMessageRequest,
};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::traits::MessageStore;

const COLUMNS: &str = "id, instance_id, recipient, content, media, scheduled_for, status, \
                       error_message, kind, transport_message_id, sent_at, created_at, updated_at";

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Messages for one instance, newest first.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub fn list_for_instance(
        &self,
        instance_id: &InstanceId,
        limit: u32,
    ) -> Result<Vec<OutboundMessageRequest>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM messages WHERE instance_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![instance_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    fn fetch(conn: &rusqlite::Connection, id: &str) -> Result<OutboundMessageRequest, StoreError> {
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => row_to_message(row),
            None => Err(StoreError::NotFound(format!("message {id}"))),
        }
    }
}

impl MessageStore for MessageRepo {
    #[instrument(skip(self, new), fields(instance_id = %new.instance_id, status = %new.status, kind = %new.kind))]
    fn create_message(&self, new: &NewMessage) -> Result<OutboundMessageRequest, StoreError> {
        let id = MessageId::new();
        let now = Utc::now();
        let media = new.media.as_ref().map(serde_json::to_string).transpose()?;

        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO messages ({COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, NULL, NULL, ?9, ?9)"
                ),
                rusqlite::params![
                    id.as_str(),
                    new.instance_id.as_str(),
                    new.recipient,
                    new.content,
                    media,
                    new.scheduled_for.as_ref().map(row_helpers::timestamp),
                    new.status.to_string(),
                    new.kind.to_string(),
                    row_helpers::timestamp(&now),
                ],
            )?;
            Ok(())
        })?;

        Ok(OutboundMessageRequest {
            id,
            instance_id: new.instance_id.clone(),
            recipient: new.recipient.clone(),
            content: new.content.clone(),
            media: new.media.clone(),
            scheduled_for: new.scheduled_for,
            status: new.status,
            error_message: None,
            kind: new.kind,
            transport_message_id: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    fn get_message(&self, id: &MessageId) -> Result<OutboundMessageRequest, StoreError> {
        self.db.with_conn(|conn| Self::fetch(conn, id.as_str()))
    }

    #[instrument(skip(self, update), fields(message_id = %id))]
    fn update_message(
        &self,
        id: &MessageId,
        update: &MessageUpdate,
    ) -> Result<OutboundMessageRequest, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET
                    status = COALESCE(?1, status),
                    error_message = COALESCE(?2, error_message),
                    transport_message_id = COALESCE(?3, transport_message_id),
                    sent_at = COALESCE(?4, sent_at),
                    updated_at = ?5
                 WHERE id = ?6",
                rusqlite::params![
                    update.status.map(|s| s.to_string()),
                    update.error_message,
                    update.transport_message_id.as_ref().map(|t| t.as_str()),
                    update.sent_at.as_ref().map(row_helpers::timestamp),
                    row_helpers::timestamp(&Utc::now()),
                    id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("message {id}")));
            }
            Self::fetch(conn, id.as_str())
        })
    }

    #[instrument(skip(self), fields(now = %now))]
    fn pending_messages(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboundMessageRequest>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM messages
                 WHERE status = 'scheduled' AND scheduled_for IS NOT NULL AND scheduled_for <= ?1
                 ORDER BY scheduled_for ASC, id ASC"
            ))?;
            let mut rows = stmt.query([row_helpers::timestamp(&now)])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    fn claim_for_sending(&self, id: &MessageId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = 'sending', updated_at = ?1
                 WHERE id = ?2 AND status = 'scheduled'",
                rusqlite::params![row_helpers::timestamp(&Utc::now()), id.as_str()],
            )?;
            Ok(changed == 1)
        })
    }

    #[instrument(skip(self), fields(transport_message_id = %transport_message_id, status = %status))]
    fn update_status_by_transport_id(
        &self,
        transport_message_id: &TransportMessageId,
        status: MessageStatus,
    ) -> Result<Option<OutboundMessageRequest>, StoreError> {
        // Acks can arrive out of order; only move forward.
        let from: &[&str] = match status {
            MessageStatus::Delivered => &["sent"],
            MessageStatus::Read => &["sent", "delivered"],
            _ => return Ok(None),
        };

        self.db.with_conn(|conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id, status FROM messages WHERE transport_message_id = ?1 LIMIT 1",
                    [transport_message_id.as_str()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?
                .and_then(|(id, current)| from.contains(&current.as_str()).then_some(id));

            let Some(id) = id else {
                debug!("ack ignored");
                return Ok(None);
            };

            conn.execute(
                "UPDATE messages SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), row_helpers::timestamp(&Utc::now()), id],
            )?;
            Self::fetch(conn, &id).map(Some)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<OutboundMessageRequest, StoreError> {
    const T: &str = "messages";
    let media: Option<String> = row_helpers::get_opt(row, 4, T, "media")?;
    let status: String = row_helpers::get(row, 6, T, "status")?;
    let kind: String = row_helpers::get(row, 8, T, "kind")?;
    let created_at: String = row_helpers::get(row, 11, T, "created_at")?;
    let updated_at: String = row_helpers::get(row, 12, T, "updated_at")?;

    Ok(OutboundMessageRequest {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        instance_id: InstanceId::from_raw(row_helpers::get::<String>(row, 1, T, "instance_id")?),
        recipient: row_helpers::get(row, 2, T, "recipient")?,
        content: row_helpers::get(row, 3, T, "content")?,
        media: media
            .map(|raw| row_helpers::parse_json::<MediaDescriptor>(&raw, T, "media"))
            .transpose()?,
        scheduled_for: row_helpers::parse_timestamp_opt(
            row_helpers::get_opt(row, 5, T, "scheduled_for")?,
            T,
            "scheduled_for",
        )?,
        status: row_helpers::parse_enum(&status, T, "status")?,
        error_message: row_helpers::get_opt(row, 7, T, "error_message")?,
        kind: row_helpers::parse_enum(&kind, T, "kind")?,
        transport_message_id: row_helpers::get_opt::<String>(row, 9, T, "transport_message_id")?
            .map(TransportMessageId::from_raw),
        sent_at: row_helpers::parse_timestamp_opt(
            row_helpers::get_opt(row, 10, T, "sent_at")?,
            T,
            "sent_at",
        )?,
        created_at: row_helpers::parse_timestamp(&created_at, T, "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_at, T, "updated_at")?,
    })
}
