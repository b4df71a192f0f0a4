//! JetStream-backed stores
//!
//! Content lives in one Object Store bucket per collection, keyed by file id,
//! with the original filename kept in the object description. Task records
//! are JSON documents in a key/value bucket keyed by task id.

use super::{
    merge_record, Collection, ContentStore, FileDescriptor, StatusStore, StoreError, TaskUpdate,
};
use anyhow::{Context, Result};
use async_nats::jetstream::{
    self, kv,
    object_store::{self, GetErrorKind, ObjectMetadata, ObjectStore},
};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

/// Bucket names for the three content collections.
#[derive(Debug, Clone)]
pub struct ContentBuckets {
    pub data: String,
    pub control: String,
    pub output: String,
}

pub struct JetStreamContentStore {
    data: ObjectStore,
    control: ObjectStore,
    output: ObjectStore,
}

impl JetStreamContentStore {
    /// Opens (or creates) the object store buckets.
    pub async fn open(jetstream: &jetstream::Context, buckets: &ContentBuckets) -> Result<Self> {
        Ok(Self {
            data: object_bucket(jetstream, &buckets.data).await?,
            control: object_bucket(jetstream, &buckets.control).await?,
            output: object_bucket(jetstream, &buckets.output).await?,
        })
    }

    fn bucket(&self, collection: Collection) -> &ObjectStore {
        match collection {
            Collection::Data => &self.data,
            Collection::Control => &self.control,
            Collection::Output => &self.output,
        }
    }
}

async fn object_bucket(jetstream: &jetstream::Context, name: &str) -> Result<ObjectStore> {
    match jetstream.get_object_store(name).await {
        Ok(store) => {
            info!("Using existing object store bucket: {}", name);
            Ok(store)
        }
        Err(_) => {
            info!("Creating object store bucket: {}", name);
            jetstream
                .create_object_store(object_store::Config {
                    bucket: name.to_string(),
                    ..Default::default()
                })
                .await
                .with_context(|| format!("Failed to create object store bucket {}", name))
        }
    }
}

#[async_trait]
impl ContentStore for JetStreamContentStore {
    async fn download(
        &self,
        collection: Collection,
        file_id: &str,
        dest_dir: &Path,
    ) -> Result<FileDescriptor, StoreError> {
        let mut object = self
            .bucket(collection)
            .get(file_id)
            .await
            .map_err(|err| match err.kind() {
                GetErrorKind::NotFound => StoreError::NotFound {
                    collection: collection.to_string(),
                    file_id: file_id.to_string(),
                },
                _ => StoreError::unavailable(err),
            })?;

        let raw_name = object
            .info
            .description
            .clone()
            .unwrap_or_else(|| object.info.name.clone());
        let descriptor =
            FileDescriptor::sanitized(&raw_name).ok_or_else(|| StoreError::Invalid {
                file_id: file_id.to_string(),
                message: format!("object description '{}' is not a file name", raw_name),
            })?;

        let target = dest_dir.join(&descriptor.filename);
        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(|err| StoreError::io(&target, err))?;
        let bytes = tokio::io::copy(&mut object, &mut file)
            .await
            .map_err(|err| StoreError::Invalid {
                file_id: file_id.to_string(),
                message: format!("failed to read object: {}", err),
            })?;
        file.flush()
            .await
            .map_err(|err| StoreError::io(&target, err))?;

        debug!(
            collection = %collection,
            file_id,
            filename = %descriptor.filename,
            bytes,
            "Retrieved object"
        );
        Ok(descriptor)
    }

    async fn upload(&self, collection: Collection, path: &Path) -> Result<String, StoreError> {
        let file_id = Uuid::new_v4().simple().to_string();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|err| StoreError::io(path, err))?;

        let info = self
            .bucket(collection)
            .put(
                ObjectMetadata {
                    name: file_id.clone(),
                    description: Some(filename),
                    ..Default::default()
                },
                &mut file,
            )
            .await
            .map_err(StoreError::unavailable)?;

        info!(
            collection = %collection,
            file_id = %file_id,
            size = info.size,
            "Uploaded object"
        );
        Ok(file_id)
    }
}

pub struct JetStreamStatusStore {
    kv_store: kv::Store,
}

impl JetStreamStatusStore {
    /// Opens (or creates) the task record bucket.
    pub async fn open(jetstream: &jetstream::Context, bucket: &str) -> Result<Self> {
        let kv_store = match jetstream.get_key_value(bucket).await {
            Ok(store) => {
                info!("Using existing KV bucket: {}", bucket);
                store
            }
            Err(_) => {
                info!("Creating new KV bucket: {}", bucket);
                jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        description: "Task execution records".to_string(),
                        ..Default::default()
                    })
                    .await
                    .with_context(|| format!("Failed to create KV bucket {}", bucket))?
            }
        };
        Ok(Self { kv_store })
    }
}

#[async_trait]
impl StatusStore for JetStreamStatusStore {
    async fn update(&self, task_id: &str, update: &TaskUpdate) -> Result<(), StoreError> {
        let existing = self
            .kv_store
            .get(task_id)
            .await
            .map_err(StoreError::unavailable)?;

        let record =
            merge_record(existing.as_deref(), update).map_err(|err| StoreError::Invalid {
                file_id: task_id.to_string(),
                message: format!("task record is not valid JSON: {}", err),
            })?;
        let value = serde_json::to_vec(&record).map_err(|err| StoreError::Invalid {
            file_id: task_id.to_string(),
            message: err.to_string(),
        })?;

        self.kv_store
            .put(task_id, value.into())
            .await
            .map_err(StoreError::unavailable)?;

        debug!(task_id, status = %update.status, "Stored task record");
        Ok(())
    }
}
