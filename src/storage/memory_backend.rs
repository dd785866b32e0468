use std::collections::BTreeMap;
use std::sync::Mutex;

use super::records::{
    decode_ongoing_entry, ongoing_key, permission_app_prefix, permission_key, ONGOING_PREFIX,
    PERMISSION_PREFIX,
};
use super::{OngoingEntry, OngoingRecord, PermissionRecord, StorageBackend, StorageError};

/// Process-local engine with the same key layout and record encoding as sled.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &str, value: Vec<u8>) {
        self.lock().insert(key.to_owned(), value);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.lock().expect("memory storage mutex poisoned")
    }

    fn scan_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.lock()
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl StorageBackend for MemoryStorage {
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn put_ongoing(&self, record: &OngoingRecord) -> Result<(), StorageError> {
        let value = serde_json::to_vec(record).map_err(StorageError::SerializeRecord)?;
        self.lock().insert(ongoing_key(&record.client_address), value);
        Ok(())
    }

    fn delete_ongoing(&self, client_address: &str) -> Result<bool, StorageError> {
        Ok(self.lock().remove(&ongoing_key(client_address)).is_some())
    }

    fn load_ongoing(&self) -> Result<Vec<OngoingEntry>, StorageError> {
        Ok(self
            .scan_prefix(ONGOING_PREFIX)
            .into_iter()
            .map(|(key, value)| decode_ongoing_entry(key.as_bytes(), &value))
            .collect())
    }

    fn put_permission(&self, record: &PermissionRecord) -> Result<(), StorageError> {
        let value = serde_json::to_vec(record).map_err(StorageError::SerializeRecord)?;
        self.lock()
            .insert(permission_key(&record.sender, &record.operation), value);
        Ok(())
    }

    fn get_permission(
        &self,
        sender: &str,
        operation: &str,
    ) -> Result<Option<PermissionRecord>, StorageError> {
        let key = permission_key(sender, operation);
        let value = self.lock().get(&key).cloned();
        value
            .map(|raw| {
                serde_json::from_slice(&raw)
                    .map_err(|source| StorageError::DeserializePermission { key, source })
            })
            .transpose()
    }

    fn delete_permission(&self, sender: &str, operation: &str) -> Result<bool, StorageError> {
        Ok(self.lock().remove(&permission_key(sender, operation)).is_some())
    }

    fn delete_app_permissions(&self, sender: &str) -> Result<usize, StorageError> {
        let prefix = permission_app_prefix(sender);
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(&prefix));
        Ok(before - entries.len())
    }

    fn load_permissions(&self) -> Result<Vec<PermissionRecord>, StorageError> {
        self.scan_prefix(PERMISSION_PREFIX)
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_slice(&value)
                    .map_err(|source| StorageError::DeserializePermission { key, source })
            })
            .collect()
    }
}
