//! Job handling: pipeline run, artifact upload and task status update

use crate::error::JobError;
use crate::metrics::Metrics;
use crate::pipeline::{JobOutcome, Pipeline};
use crate::store::{Collection, ContentStore, StatusStore, TaskStatus, TaskUpdate};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Queue message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub task_id: String,
    #[serde(alias = "dataFid")]
    pub data_file_id: String,
    #[serde(alias = "controlFid")]
    pub control_file_id: String,
}

pub struct JobHandler<C: ContentStore, S: StatusStore> {
    pipeline: Pipeline<C>,
    status_store: Arc<S>,
    metrics: Metrics,
}

impl<C: ContentStore, S: StatusStore> JobHandler<C, S> {
    pub fn new(pipeline: Pipeline<C>, status_store: Arc<S>, metrics: Metrics) -> Self {
        Self {
            pipeline,
            status_store,
            metrics,
        }
    }

    /// Runs the job and records its result under the task id.
    ///
    /// Per-job failures are recorded as a failed task and returned as `Ok`.
    /// `Err` means the result could not be recorded; it is fatal when the
    /// stores are unreachable.
    pub async fn process(&mut self, job: &JobDescriptor) -> Result<TaskUpdate, JobError> {
        let started = Instant::now();
        info!(task_id = %job.task_id, "Processing job");

        let update = match self
            .pipeline
            .execute(&job.data_file_id, &job.control_file_id)
            .await
        {
            Ok(outcome) => match self.upload(&outcome).await {
                Ok(output_file_id) => done(&outcome, output_file_id),
                Err(err) => {
                    // Stage failures are already counted by the pipeline.
                    self.metrics.record_error(err.code());
                    let message = err.to_string();
                    failed(job, err, message, outcome.output_text())?
                }
            },
            Err(err) => {
                let (message, output) = (err.to_string(), err.output_text());
                failed(job, err.source, message, output)?
            }
        };

        self.status_store
            .update(&job.task_id, &update)
            .await
            .map_err(|err| err.into_job_error("tasks", &job.task_id))?;

        self.metrics.record_job(
            &update.status.to_string(),
            started.elapsed(),
            !update.output_file_id.is_empty(),
        );
        info!(
            task_id = %job.task_id,
            status = %update.status,
            output_file_id = %update.output_file_id,
            "Recorded task result"
        );
        Ok(update)
    }

    async fn upload(&self, outcome: &JobOutcome) -> Result<String, JobError> {
        let Some(artifact) = &outcome.artifact else {
            return Ok(String::new());
        };
        self.pipeline
            .store()
            .upload(Collection::Output, artifact)
            .await
            .map_err(|err| err.into_job_error("output", &artifact.display().to_string()))
    }
}

/// Failed task record. Fatal errors are handed back instead.
fn failed(
    job: &JobDescriptor,
    err: JobError,
    message: String,
    output: String,
) -> Result<TaskUpdate, JobError> {
    if err.is_fatal() {
        error!(task_id = %job.task_id, error = %err, "Job aborted, stores unreachable");
        return Err(err);
    }
    warn!(
        task_id = %job.task_id,
        code = err.code(),
        error = %message,
        "Job failed"
    );
    Ok(TaskUpdate {
        output,
        status: TaskStatus::Failed,
        output_file_id: String::new(),
        error: Some(message),
        completed_at: Utc::now(),
    })
}

fn done(outcome: &JobOutcome, output_file_id: String) -> TaskUpdate {
    TaskUpdate {
        output: outcome.output_text(),
        status: TaskStatus::Done,
        output_file_id,
        error: outcome.script_error.as_ref().map(|err| err.to_string()),
        completed_at: Utc::now(),
    }
}
