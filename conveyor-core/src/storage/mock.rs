use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Locator, ObjectStat, StorageBackend, StorageError};

/// In-memory storage for tests: objects keyed by their locator string.
#[derive(Clone, Default)]
pub struct MockStorage {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, locator: &str, bytes: Vec<u8>) -> Self {
        self.objects
            .lock()
            .expect("poisoned MockStorage lock")
            .insert(locator.to_owned(), bytes);
        self
    }

    /// Make every subsequent call fail as a backend outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().expect("poisoned MockStorage lock") = unavailable;
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if *self.unavailable.lock().expect("poisoned MockStorage lock") {
            Err(StorageError::Unavailable("mock outage".to_owned()))
        } else {
            Ok(())
        }
    }

    fn get(&self, locator: &Locator) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .expect("poisoned MockStorage lock")
            .get(&locator.to_string())
            .cloned()
    }
}

#[async_trait]
impl StorageBackend for MockStorage {
    async fn stat(&self, locator: &Locator) -> Result<ObjectStat, StorageError> {
        self.check_available()?;
        match self.get(locator) {
            Some(bytes) => Ok(ObjectStat {
                size: bytes.len() as u64,
            }),
            None => Err(StorageError::NotFound(locator.to_string())),
        }
    }

    async fn exists(&self, locator: &Locator) -> Result<bool, StorageError> {
        self.check_available()?;
        Ok(self.get(locator).is_some())
    }

    async fn download_to(&self, locator: &Locator, dest: &Path) -> Result<u64, StorageError> {
        self.check_available()?;
        let bytes = self
            .get(locator)
            .ok_or_else(|| StorageError::NotFound(locator.to_string()))?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(bytes.len() as u64)
    }

    async fn upload_file(&self, src: &Path, locator: &Locator) -> Result<(), StorageError> {
        self.check_available()?;
        let bytes = tokio::fs::read(src)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let mut objects = self.objects.lock().expect("poisoned MockStorage lock");
        let key = locator.to_string();
        if objects.contains_key(&key) {
            return Err(StorageError::Conflict(key));
        }
        objects.insert(key, bytes);
        Ok(())
    }
}
