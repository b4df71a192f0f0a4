//! contra-exec - runs control scripts against data bundles in an isolated
//! workspace and archives the files the script created or changed
//!
//! A job names a data archive and a control script in the content store. The
//! worker unpacks the data, places the script next to the payload, runs it,
//! snapshots the tree before and after, and packages only the difference. The
//! result is uploaded and written to the task record; jobs arrive over a NATS
//! JetStream work queue.

pub mod archive;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod packager;
pub mod payload;
pub mod pipeline;
pub mod sandbox;
pub mod store;
pub mod workspace;

pub use config::Config;
pub use consumer::JobConsumer;
pub use error::{JobError, ScriptError};
pub use handler::{JobDescriptor, JobHandler};
pub use metrics::Metrics;
pub use pipeline::{JobOutcome, Pipeline, PipelineError, PipelineSettings, Stage};
pub use store::{
    Collection, ContentStore, FileDescriptor, StatusStore, StoreError, TaskStatus, TaskUpdate,
};
pub use workspace::Workspace;
