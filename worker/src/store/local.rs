//! Directory-backed content store for manual runs and tests.
//!
//! Layout: `<root>/<collection>/<file_id>/<filename>`, one file per id
//! directory.

use super::{Collection, ContentStore, FileDescriptor, StoreError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copies `source` into the store under a fresh id. Used to seed inputs.
    pub async fn insert(&self, collection: Collection, source: &Path) -> Result<String, StoreError> {
        let file_id = Uuid::new_v4().simple().to_string();
        let filename = FileDescriptor::sanitized(&source.to_string_lossy()).ok_or_else(|| {
            StoreError::Invalid {
                file_id: file_id.clone(),
                message: format!("'{}' has no usable file name", source.display()),
            }
        })?;

        let dir = self.id_dir(collection, &file_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| StoreError::io(&dir, err))?;
        let target = dir.join(&filename.filename);
        fs::copy(source, &target)
            .await
            .map_err(|err| StoreError::io(source, err))?;
        Ok(file_id)
    }

    fn id_dir(&self, collection: Collection, file_id: &str) -> PathBuf {
        self.root.join(collection.as_str()).join(file_id)
    }

    async fn stored_file(
        &self,
        collection: Collection,
        file_id: &str,
    ) -> Result<(PathBuf, FileDescriptor), StoreError> {
        let not_found = || StoreError::NotFound {
            collection: collection.to_string(),
            file_id: file_id.to_string(),
        };
        // Ids are single path components; anything else cannot name a stored file.
        if FileDescriptor::sanitized(file_id).map(|d| d.filename) != Some(file_id.to_string()) {
            return Err(not_found());
        }

        let dir = self.id_dir(collection, file_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(err) => return Err(StoreError::io(&dir, err)),
        };

        let entry = entries
            .next_entry()
            .await
            .map_err(|err| StoreError::io(&dir, err))?
            .ok_or_else(not_found)?;
        let descriptor = FileDescriptor::sanitized(&entry.file_name().to_string_lossy())
            .ok_or_else(|| StoreError::Invalid {
                file_id: file_id.to_string(),
                message: "stored file has no usable name".to_string(),
            })?;
        Ok((entry.path(), descriptor))
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn download(
        &self,
        collection: Collection,
        file_id: &str,
        dest_dir: &Path,
    ) -> Result<FileDescriptor, StoreError> {
        let (source, descriptor) = self.stored_file(collection, file_id).await?;
        let target = dest_dir.join(&descriptor.filename);
        let bytes = fs::copy(&source, &target)
            .await
            .map_err(|err| StoreError::io(&target, err))?;
        debug!(
            collection = %collection,
            file_id,
            filename = %descriptor.filename,
            bytes,
            "Retrieved file from local store"
        );
        Ok(descriptor)
    }

    async fn upload(&self, collection: Collection, path: &Path) -> Result<String, StoreError> {
        self.insert(collection, path).await
    }
}
