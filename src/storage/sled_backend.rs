use std::path::Path;

use super::records::{
    decode_ongoing_entry, ongoing_key, permission_app_prefix, permission_key, ONGOING_PREFIX,
    PERMISSION_PREFIX,
};
use super::{OngoingEntry, OngoingRecord, PermissionRecord, SledMode, StorageBackend, StorageError};

pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        if let Some(mode) = mode {
            config = config.mode(mode.into_sled());
        }

        let db = config.open().map_err(StorageError::Sled)?;
        Ok(Self { db })
    }

    fn insert_and_flush(&self, key: String, value: Vec<u8>) -> Result<(), StorageError> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(StorageError::Sled)?;
        self.db.flush().map_err(StorageError::Sled)?;
        Ok(())
    }

    fn remove_and_flush(&self, key: String) -> Result<bool, StorageError> {
        let removed = self
            .db
            .remove(key.as_bytes())
            .map_err(StorageError::Sled)?
            .is_some();
        if removed {
            self.db.flush().map_err(StorageError::Sled)?;
        }
        Ok(removed)
    }
}

fn decode_permission(key: &[u8], value: &[u8]) -> Result<PermissionRecord, StorageError> {
    serde_json::from_slice(value).map_err(|source| StorageError::DeserializePermission {
        key: String::from_utf8_lossy(key).to_string(),
        source,
    })
}

impl StorageBackend for SledStorage {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }

    fn put_ongoing(&self, record: &OngoingRecord) -> Result<(), StorageError> {
        let value = serde_json::to_vec(record).map_err(StorageError::SerializeRecord)?;
        self.insert_and_flush(ongoing_key(&record.client_address), value)
    }

    fn delete_ongoing(&self, client_address: &str) -> Result<bool, StorageError> {
        self.remove_and_flush(ongoing_key(client_address))
    }

    fn load_ongoing(&self) -> Result<Vec<OngoingEntry>, StorageError> {
        let mut entries = Vec::new();
        for entry in self.db.scan_prefix(ONGOING_PREFIX.as_bytes()) {
            let (key, value) = entry.map_err(StorageError::Sled)?;
            entries.push(decode_ongoing_entry(key.as_ref(), value.as_ref()));
        }
        Ok(entries)
    }

    fn put_permission(&self, record: &PermissionRecord) -> Result<(), StorageError> {
        let value = serde_json::to_vec(record).map_err(StorageError::SerializeRecord)?;
        self.insert_and_flush(permission_key(&record.sender, &record.operation), value)
    }

    fn get_permission(
        &self,
        sender: &str,
        operation: &str,
    ) -> Result<Option<PermissionRecord>, StorageError> {
        let key = permission_key(sender, operation);
        let value = self.db.get(key.as_bytes()).map_err(StorageError::Sled)?;
        value
            .map(|raw| decode_permission(key.as_bytes(), raw.as_ref()))
            .transpose()
    }

    fn delete_permission(&self, sender: &str, operation: &str) -> Result<bool, StorageError> {
        self.remove_and_flush(permission_key(sender, operation))
    }

    fn delete_app_permissions(&self, sender: &str) -> Result<usize, StorageError> {
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        for entry in self.db.scan_prefix(permission_app_prefix(sender).as_bytes()) {
            let (key, _) = entry.map_err(StorageError::Sled)?;
            batch.remove(key);
            removed += 1;
        }

        if removed > 0 {
            self.db.apply_batch(batch).map_err(StorageError::Sled)?;
            self.db.flush().map_err(StorageError::Sled)?;
        }
        Ok(removed)
    }

    fn load_permissions(&self) -> Result<Vec<PermissionRecord>, StorageError> {
        let mut records = Vec::new();
        for entry in self.db.scan_prefix(PERMISSION_PREFIX.as_bytes()) {
            let (key, value) = entry.map_err(StorageError::Sled)?;
            records.push(decode_permission(key.as_ref(), value.as_ref())?);
        }
        Ok(records)
    }
}
