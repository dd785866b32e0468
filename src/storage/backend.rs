use super::{OngoingEntry, OngoingRecord, PermissionRecord, StorageError};

/// Narrow key/value contract the broker needs from a persistence engine.
pub trait StorageBackend: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;

    fn put_ongoing(&self, record: &OngoingRecord) -> Result<(), StorageError>;
    fn delete_ongoing(&self, client_address: &str) -> Result<bool, StorageError>;
    /// Consistent snapshot of every persisted ongoing request, undecodable entries included.
    fn load_ongoing(&self) -> Result<Vec<OngoingEntry>, StorageError>;

    fn put_permission(&self, record: &PermissionRecord) -> Result<(), StorageError>;
    fn get_permission(
        &self,
        sender: &str,
        operation: &str,
    ) -> Result<Option<PermissionRecord>, StorageError>;
    fn delete_permission(&self, sender: &str, operation: &str) -> Result<bool, StorageError>;
    fn delete_app_permissions(&self, sender: &str) -> Result<usize, StorageError>;
    fn load_permissions(&self) -> Result<Vec<PermissionRecord>, StorageError>;
}
