mod backend;
mod engine;
mod error;
mod facade;
mod memory_backend;
mod path;
mod records;
mod sled_backend;

pub use backend::StorageBackend;
pub use engine::{SledMode, StorageEngine};
pub use error::StorageError;
pub use facade::StorageFacade;
pub use memory_backend::MemoryStorage;
use path::expand_home_path;
pub use records::{OngoingEntry, OngoingRecord, PermissionDecision, PermissionRecord};
pub use sled_backend::SledStorage;
