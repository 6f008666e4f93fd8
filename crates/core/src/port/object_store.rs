// Object Store Port
//
// Blob storage for rule artifacts and finding payloads. Keys are hierarchical
// (`{job_id}/{rule_id}_{target}_{ms}.json`); `put` returns an opaque locator
// that `get` accepts.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O failed: {0}")]
    Io(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, ObjectStoreError>;

    async fn get(&self, locator: &str) -> Result<Vec<u8>, ObjectStoreError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const SCHEME: &str = "mem://";

    /// In-memory object store; puts whose key contains `fail_on` are rejected
    #[derive(Default)]
    pub struct InMemoryObjectStore {
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
        fail_on: Mutex<Option<String>>,
    }

    impl InMemoryObjectStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_puts_containing(&self, pattern: impl Into<String>) {
            *self.fail_on.lock().unwrap() = Some(pattern.into());
        }

        pub fn keys(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }

        pub fn insert(&self, key: &str, bytes: &[u8]) -> String {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), bytes.to_vec());
            format!("{}{}", SCHEME, key)
        }
    }

    #[async_trait]
    impl ObjectStore for InMemoryObjectStore {
        async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, ObjectStoreError> {
            if let Some(pattern) = self.fail_on.lock().unwrap().as_deref() {
                if key.contains(pattern) {
                    return Err(ObjectStoreError::Io(format!("injected failure for {}", key)));
                }
            }
            Ok(self.insert(key, &bytes))
        }

        async fn get(&self, locator: &str) -> Result<Vec<u8>, ObjectStoreError> {
            let key = locator.strip_prefix(SCHEME).unwrap_or(locator);
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| ObjectStoreError::NotFound(locator.to_string()))
        }
    }
}
