use chrono::Utc;
use tracing::instrument;

use herald_core::ids::InstanceId;
use herald_core::instance::MessagingInstance;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::traits::InstanceStore;

const COLUMNS: &str = "id, phone_number, display_name, connection_state, qr_code, \
                       last_connected_at, last_error, created_at, updated_at";

pub struct InstanceRepo {
    db: Database,
}

impl InstanceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl InstanceStore for InstanceRepo {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    fn create_instance(&self, instance: &MessagingInstance) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO instances ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                rusqlite::params![
                    instance.id.as_str(),
                    instance.phone_number,
                    instance.display_name,
                    instance.connection_state.to_string(),
                    instance.qr_code,
                    instance.last_connected_at.as_ref().map(row_helpers::timestamp),
                    instance.last_error,
                    row_helpers::timestamp(&instance.created_at),
                    row_helpers::timestamp(&instance.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    fn get_instance(&self, id: &InstanceId) -> Result<MessagingInstance, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM instances WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_instance(row),
                None => Err(StoreError::NotFound(format!("instance {id}"))),
            }
        })
    }

    #[instrument(skip(self))]
    fn list_instances(&self) -> Result<Vec<MessagingInstance>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM instances ORDER BY created_at ASC"))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_instance(row)?);
            }
            Ok(results)
        })
    }

    /// Overwrite the mutable fields of an existing instance.
    #[instrument(skip(self, instance), fields(instance_id = %instance.id, state = %instance.connection_state))]
    fn save_instance(&self, instance: &MessagingInstance) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE instances SET phone_number = ?1, display_name = ?2, connection_state = ?3,
                        qr_code = ?4, last_connected_at = ?5, last_error = ?6, updated_at = ?7
                 WHERE id = ?8",
                rusqlite::params![
                    instance.phone_number,
                    instance.display_name,
                    instance.connection_state.to_string(),
                    instance.qr_code,
                    instance.last_connected_at.as_ref().map(row_helpers::timestamp),
                    instance.last_error,
                    row_helpers::timestamp(&Utc::now()),
                    instance.id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("instance {}", instance.id)));
            }
            Ok(())
        })
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> Result<MessagingInstance, StoreError> {
    const T: &str = "instances";
    let state: String = row_helpers::get(row, 3, T, "connection_state")?;
    let created_at: String = row_helpers::get(row, 7, T, "created_at")?;
    let updated_at: String = row_helpers::get(row, 8, T, "updated_at")?;

    Ok(MessagingInstance {
        id: InstanceId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        phone_number: row_helpers::get(row, 1, T, "phone_number")?,
        display_name: row_helpers::get(row, 2, T, "display_name")?,
        connection_state: row_helpers::parse_enum(&state, T, "connection_state")?,
        qr_code: row_helpers::get_opt(row, 4, T, "qr_code")?,
        last_connected_at: row_helpers::parse_timestamp_opt(
            row_helpers::get_opt(row, 5, T, "last_connected_at")?,
            T,
            "last_connected_at",
        )?,
        last_error: row_helpers::get_opt(row, 6, T, "last_error")?,
        created_at: row_helpers::parse_timestamp(&created_at, T, "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_at, T, "updated_at")?,
    })
}
