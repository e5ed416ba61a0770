pub mod entity_key;
pub mod error;
pub mod file_id;

pub use entity_key::EntityKey;
pub use error::{Result, StowageError};
pub use file_id::FileId;
