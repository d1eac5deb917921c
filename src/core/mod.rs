pub mod entity;
pub mod envelope;
pub mod error;

pub use entity::{EntityKey, EntityRecord};
pub use envelope::{Actor, CommandEnvelope, CommandRequest, DeliveryState};
pub use error::{ErrorInfo, ErrorKind, Result, SyncError};
