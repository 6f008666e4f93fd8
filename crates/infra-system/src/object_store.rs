// Filesystem object store
//
// Keys map to paths under a root directory; locators are `file://` URLs.
// Writes go to a temp file first and are renamed into place, so a reader
// never sees a half-written object.
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use scanfleet_core::port::{ObjectStore, ObjectStoreError};

const SCHEME: &str = "file://";

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locator_for(path: &Path) -> String {
        format!("{}{}", SCHEME, path.display())
    }

    /// Relative keys only, no `..`
    fn path_for_key(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// `file://` locators are absolute paths; anything else is a key under the root
    fn path_for_locator(&self, locator: &str) -> Result<PathBuf, ObjectStoreError> {
        match locator.strip_prefix(SCHEME) {
            Some(path) if Path::new(path).is_absolute() => Ok(PathBuf::from(path)),
            Some(_) => Err(ObjectStoreError::InvalidKey(locator.to_string())),
            None => self.path_for_key(locator),
        }
    }
}

fn io_error(path: &Path, err: std::io::Error) -> ObjectStoreError {
    match err.kind() {
        ErrorKind::NotFound => ObjectStoreError::NotFound(path.display().to_string()),
        _ => ObjectStoreError::Io(format!("{}: {}", path.display(), err)),
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, ObjectStoreError> {
        let path = self.path_for_key(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".part");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;

        debug!(key = %key, bytes = bytes.len(), "Object stored");
        Ok(Self::locator_for(&path))
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.path_for_locator(locator)?;
        tokio::fs::read(&path).await.map_err(|e| io_error(&path, e))
    }
}
