pub mod database;
pub mod error;
pub mod instances;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod traits;

pub use database::Database;
pub use error::StoreError;
pub use instances::InstanceRepo;
pub use messages::MessageRepo;
pub use traits::{InstanceStore, MessageStore};
