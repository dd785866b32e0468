use std::fs;
use std::path::PathBuf;

use serde_json::json;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};

use super::{
    expand_home_path, MemoryStorage, OngoingEntry, OngoingRecord, PermissionDecision,
    PermissionRecord, SledMode, SledStorage, StorageBackend, StorageEngine, StorageError,
};

pub struct StorageFacade {
    engine: StorageEngine,
    data_path: Option<PathBuf>,
    backend: Box<dyn StorageBackend>,
}

impl StorageFacade {
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let Some(engine) = StorageEngine::parse(&app_config.storage.engine) else {
            return Err(StorageError::UnsupportedEngine {
                engine: app_config.storage.engine.clone(),
            });
        };

        if engine == StorageEngine::Memory {
            logger.log(
                LogLevel::Warn,
                Some("storage::init"),
                "Using in-memory storage; ongoing requests will not survive a restart",
                None,
            );
            return Ok(Self::in_memory());
        }

        let data_path = expand_home_path(&app_config.storage.path)?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Initializing storage facade",
            Some(json!({
                "engine": engine.as_str(),
                "configured_path": app_config.storage.path,
                "resolved_path": data_path.display().to_string(),
                "sled": {
                    "cache_capacity": app_config.storage.sled.cache_capacity,
                    "mode": app_config.storage.sled.mode
                }
            })),
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let mode = match app_config.storage.sled.mode.as_deref() {
            Some(raw) => Some(SledMode::parse(raw).ok_or_else(|| StorageError::InvalidSledMode {
                mode: raw.to_owned(),
            })?),
            None => None,
        };
        let backend = SledStorage::open(&data_path, app_config.storage.sled.cache_capacity, mode)?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Storage facade initialized",
            Some(json!({
                "engine": engine.as_str(),
                "resolved_path": data_path.display().to_string(),
            })),
        );

        Ok(Self {
            engine,
            data_path: Some(data_path),
            backend: Box::new(backend),
        })
    }

    pub fn in_memory() -> Self {
        Self::with_backend(StorageEngine::Memory, Box::new(MemoryStorage::new()))
    }

    pub fn with_backend(engine: StorageEngine, backend: Box<dyn StorageBackend>) -> Self {
        Self {
            engine,
            data_path: None,
            backend,
        }
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> Option<&PathBuf> {
        self.data_path.as_ref()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }

    pub fn put_ongoing(
        &self,
        client_address: &str,
        envelope: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.backend
            .put_ongoing(&OngoingRecord::new(client_address, envelope))
    }

    pub fn delete_ongoing(&self, client_address: &str) -> Result<bool, StorageError> {
        self.backend.delete_ongoing(client_address)
    }

    pub fn load_ongoing(&self) -> Result<Vec<OngoingEntry>, StorageError> {
        self.backend.load_ongoing()
    }

    pub fn put_permission(
        &self,
        sender: &str,
        operation: &str,
        decision: PermissionDecision,
    ) -> Result<(), StorageError> {
        self.backend
            .put_permission(&PermissionRecord::new(sender, operation, decision))
    }

    pub fn get_permission(
        &self,
        sender: &str,
        operation: &str,
    ) -> Result<Option<PermissionRecord>, StorageError> {
        self.backend.get_permission(sender, operation)
    }

    pub fn delete_permission(&self, sender: &str, operation: &str) -> Result<bool, StorageError> {
        self.backend.delete_permission(sender, operation)
    }

    pub fn delete_app_permissions(&self, sender: &str) -> Result<usize, StorageError> {
        self.backend.delete_app_permissions(sender)
    }

    pub fn load_permissions(&self) -> Result<Vec<PermissionRecord>, StorageError> {
        self.backend.load_permissions()
    }
}
