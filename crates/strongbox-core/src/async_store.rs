//! Tokio front end for [`SecureStore`].
//!
//! Lock waits and file I/O are blocking, so every call runs on the blocking
//! pool and only the calling task is suspended.

use crate::error::{Result, StoreError};
use crate::lock::LockOptions;
use crate::store::{EncryptionStatus, SecureStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AsyncSecureStore {
    store: SecureStore,
}

impl From<SecureStore> for AsyncSecureStore {
    fn from(store: SecureStore) -> Self {
        Self { store }
    }
}

impl AsyncSecureStore {
    pub fn new(store: SecureStore) -> Self {
        Self { store }
    }

    pub fn blocking(&self) -> &SecureStore {
        &self.store
    }

    pub fn with_lock_options(&self, lock_options: LockOptions) -> Self {
        Self {
            store: self.store.with_lock_options(lock_options),
        }
    }

    pub fn status(&self) -> EncryptionStatus {
        self.store.status()
    }

    pub async fn save(&self, path: impl AsRef<Path>, data: Vec<u8>) -> Result<()> {
        self.run(path, move |store, path| store.save(path, &data)).await
    }

    pub async fn load(&self, path: impl AsRef<Path>) -> Result<Option<Vec<u8>>> {
        self.run(path, |store, path| store.load(path)).await
    }

    pub async fn delete(&self, path: impl AsRef<Path>) -> Result<bool> {
        self.run(path, |store, path| store.delete(path)).await
    }

    pub async fn exists(&self, path: impl AsRef<Path>) -> Result<bool> {
        self.run(path, |store, path| Ok(store.exists(path))).await
    }

    pub async fn save_json<T: Serialize>(&self, path: impl AsRef<Path>, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.save(path, bytes).await
    }

    pub async fn load_json<T: DeserializeOwned + Send + 'static>(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Option<T>> {
        self.run(path, |store, path| store.load_json(path)).await
    }

    async fn run<T, F>(&self, path: impl AsRef<Path>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SecureStore, PathBuf) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || f(&store, path))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}
