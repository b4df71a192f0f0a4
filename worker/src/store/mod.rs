//! Content and status store abstractions
//!
//! The worker talks to two external stores: a content store holding uploaded
//! inputs and produced artifacts, and a status store holding one record per
//! task. Both are traits so the pipeline can run against JetStream in
//! production and against a local directory or memory in tests.

pub mod jetstream;
pub mod local;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use self::jetstream::{JetStreamContentStore, JetStreamStatusStore};
pub use self::local::LocalContentStore;
pub use self::memory::MemoryStatusStore;

/// Logical collections of the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Data,
    Control,
    Output,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Data => "data",
            Collection::Control => "control",
            Collection::Output => "output",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of a retrieved file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub filename: String,
}

impl FileDescriptor {
    /// Builds a descriptor from store-provided metadata, keeping only the final
    /// path component so a stored name can never escape the target directory.
    pub fn sanitized(raw: &str) -> Option<Self> {
        let name = Path::new(raw).file_name()?.to_str()?;
        if name.is_empty() || name == "." || name == ".." {
            return None;
        }
        Some(Self {
            filename: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Done,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Fields written to a task record when a job finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub output: String,
    pub status: TaskStatus,
    /// Empty when the job produced no artifact.
    pub output_file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{collection} file '{file_id}' not found")]
    NotFound { collection: String, file_id: String },

    #[error("stored file '{file_id}' is unusable: {message}")]
    Invalid { file_id: String, message: String },

    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn unavailable(err: impl std::fmt::Display) -> Self {
        StoreError::Unavailable {
            message: err.to_string(),
        }
    }

    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Opaque-id addressed blob storage.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Writes the stored file into `dest_dir` under its original filename.
    async fn download(
        &self,
        collection: Collection,
        file_id: &str,
        dest_dir: &Path,
    ) -> Result<FileDescriptor, StoreError>;

    /// Stores the file at `path` and returns its new id.
    async fn upload(&self, collection: Collection, path: &Path) -> Result<String, StoreError>;
}

/// Keyed task records.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Merges `update` into the record stored under `task_id`.
    async fn update(&self, task_id: &str, update: &TaskUpdate) -> Result<(), StoreError>;
}

/// Merges the update fields into an existing JSON record, keeping any other
/// fields the submitter stored there.
pub(crate) fn merge_record(
    existing: Option<&[u8]>,
    update: &TaskUpdate,
) -> Result<serde_json::Value, serde_json::Error> {
    let mut record = match existing {
        Some(bytes) => match serde_json::from_slice::<serde_json::Value>(bytes)? {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        },
        None => serde_json::Map::new(),
    };
    if let serde_json::Value::Object(fields) = serde_json::to_value(update)? {
        record.extend(fields);
    }
    Ok(serde_json::Value::Object(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update() -> TaskUpdate {
        TaskUpdate {
            output: "hello\n".to_string(),
            status: TaskStatus::Done,
            output_file_id: String::new(),
            error: None,
            completed_at: "2025-01-06T10:30:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn test_sanitized_descriptor_drops_directories() {
        assert_eq!(
            FileDescriptor::sanitized("../../etc/data.tar.gz").unwrap().filename,
            "data.tar.gz"
        );
        assert_eq!(
            FileDescriptor::sanitized("run.sh").unwrap().filename,
            "run.sh"
        );
        assert!(FileDescriptor::sanitized("").is_none());
        assert!(FileDescriptor::sanitized("..").is_none());
        assert!(FileDescriptor::sanitized("/").is_none());
    }

    #[test]
    fn test_task_update_uses_camel_case() {
        let json = serde_json::to_value(update()).unwrap();
        assert_eq!(json["status"], "done");
        assert_eq!(json["outputFileId"], "");
        assert!(json.get("error").is_none());
        assert!(json.get("completedAt").is_some());
    }

    #[test]
    fn test_merge_keeps_submitter_fields() {
        let existing = br#"{"name":"nightly","status":"queued"}"#;
        let merged = merge_record(Some(&existing[..]), &update()).unwrap();
        assert_eq!(merged["name"], "nightly");
        assert_eq!(merged["status"], "done");
        assert_eq!(merged["output"], "hello\n");
    }

    #[test]
    fn test_merge_without_existing_record() {
        let merged = merge_record(None, &update()).unwrap();
        assert_eq!(merged["status"], "done");
    }
}
