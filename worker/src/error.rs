//! Error taxonomy for job execution

use crate::store::StoreError;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failure of a pipeline stage or of the surrounding job plumbing.
///
/// Everything except [`JobError::Connectivity`] is scoped to a single job: the
/// failure is recorded against the task and the worker moves on.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Store unreachable: {message}")]
    Connectivity { message: String },

    #[error("Failed to retrieve {collection} file '{file_id}': {message}")]
    Retrieval {
        collection: String,
        file_id: String,
        message: String,
    },

    #[error("Unsupported archive format: {filename}")]
    UnsupportedFormat { filename: String },

    #[error("{tool} exited with {status}: {output}")]
    ExternalTool {
        tool: String,
        status: String,
        output: String,
    },

    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl JobError {
    pub fn filesystem(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        JobError::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            JobError::Connectivity { .. } => "JOB_CONNECTIVITY_ERROR",
            JobError::Retrieval { .. } => "JOB_RETRIEVAL_ERROR",
            JobError::UnsupportedFormat { .. } => "JOB_UNSUPPORTED_FORMAT",
            JobError::ExternalTool { .. } => "JOB_EXTERNAL_TOOL_ERROR",
            JobError::Filesystem { .. } => "JOB_FILESYSTEM_ERROR",
        }
    }

    /// Only lost connectivity is allowed to take the worker process down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, JobError::Connectivity { .. })
    }
}

impl From<fstree::TreeError> for JobError {
    fn from(err: fstree::TreeError) -> Self {
        match err {
            fstree::TreeError::Io { path, source } => JobError::Filesystem { path, source },
            other => JobError::Filesystem {
                path: PathBuf::new(),
                source: std::io::Error::other(other.to_string()),
            },
        }
    }
}

impl StoreError {
    /// Maps a store failure onto the job taxonomy for the given collection.
    pub fn into_job_error(self, collection: &str, file_id: &str) -> JobError {
        match self {
            StoreError::Unavailable { message } => JobError::Connectivity { message },
            StoreError::Io { path, source } => JobError::Filesystem { path, source },
            other => JobError::Retrieval {
                collection: collection.to_string(),
                file_id: file_id.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Non-fatal outcome of the control script. The job still completes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("control script exited with {}", describe_code(.code))]
    ExitStatus { code: Option<i32> },

    #[error("control script exceeded {limit_secs}s and was killed")]
    Timeout { limit_secs: u64 },

    #[error("failed to start control script: {message}")]
    Spawn { message: String },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}
