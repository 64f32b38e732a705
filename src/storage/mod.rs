//! JSON document store on the local filesystem.
//!
//! Documents are addressed by key segments (`["part", message_id, part_id]`)
//! and stored at `<root>/<segments...>.json`. Every access holds the
//! [`FairLock`] for the document path: reads share it, writes and updates
//! take it exclusively. Callers must not hold one document's guard while
//! requesting another's.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{KilnError, Result};
use crate::lock::FairLock;

const EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    lock: FairLock,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: FairLock::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lock table guarding documents; exposed for diagnostics.
    pub fn lock(&self) -> &FairLock {
        &self.lock
    }

    fn path(&self, key: &[&str]) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key {
            path.push(segment);
        }
        path.set_extension(EXTENSION);
        path
    }

    pub async fn read<T: DeserializeOwned>(&self, key: &[&str]) -> Result<T> {
        let path = self.path(key);
        let _guard = self.lock.read(path.to_string_lossy()).await;
        read_document(&path, key).await
    }

    pub async fn write<T: Serialize>(&self, key: &[&str], value: &T) -> Result<()> {
        let path = self.path(key);
        let _guard = self.lock.write(path.to_string_lossy()).await;
        write_document(&path, value).await
    }

    /// Read-modify-write under one exclusive guard; returns the new value.
    pub async fn update<T, F>(&self, key: &[&str], mutate: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let path = self.path(key);
        let _guard = self.lock.write(path.to_string_lossy()).await;
        let mut value: T = read_document(&path, key).await?;
        mutate(&mut value);
        write_document(&path, &value).await?;
        Ok(value)
    }

    /// Delete a document. Removing a missing document is not an error.
    pub async fn remove(&self, key: &[&str]) -> Result<()> {
        let path = self.path(key);
        let _guard = self.lock.write(path.to_string_lossy()).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Keys of every document below `prefix`, sorted.
    pub async fn list(&self, prefix: &[&str]) -> Result<Vec<Vec<String>>> {
        let mut base = self.root.clone();
        for segment in prefix {
            base.push(segment);
        }

        let mut keys = Vec::new();
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|ext| ext == EXTENSION) {
                    if let Ok(relative) = path.with_extension("").strip_prefix(&self.root) {
                        keys.push(
                            relative
                                .components()
                                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                                .collect(),
                        );
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

async fn read_document<T: DeserializeOwned>(path: &Path, key: &[&str]) -> Result<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(KilnError::NotFound(key.join("/")));
        }
        Err(err) => return Err(err.into()),
    };
    Ok(serde_json::from_slice(&bytes)?)
}

async fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    let staging = path.with_extension("json.tmp");
    tokio::fs::write(&staging, body).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}
