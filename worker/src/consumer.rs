//! NATS JetStream consumer for queued jobs

use crate::config::Config;
use crate::handler::{JobDescriptor, JobHandler};
use crate::metrics::Metrics;
use crate::store::{ContentStore, StatusStore};
use anyhow::{Context, Result};
use async_nats::jetstream::{
    self,
    consumer::{AckPolicy, DeliverPolicy, PullConsumer},
    stream::{RetentionPolicy, Stream},
};
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one fetch waits for a job before polling again.
const FETCH_EXPIRY_SECS: u64 = 30;

/// Connects to NATS as the configured client.
///
/// A credentials file wins over user/password.
pub async fn connect(config: &Config) -> Result<async_nats::Client> {
    info!("Connecting to NATS at {}", config.nats_url);

    let options = async_nats::ConnectOptions::new().name(&config.client_id);
    let client = if let Some(creds_path) = &config.nats_creds_path {
        info!("Using credentials file: {}", creds_path);
        options
            .credentials_file(creds_path)
            .await
            .context("Failed to load NATS credentials")?
            .connect(&config.nats_url)
            .await
            .context("Failed to connect to NATS with credentials")?
    } else {
        options
            .user_and_password(config.nats_user.clone(), config.nats_password.clone())
            .connect(&config.nats_url)
            .await
            .context("Failed to connect to NATS")?
    };

    info!(client_id = %config.client_id, "Successfully connected to NATS");
    Ok(client)
}

/// Job consumer - pulls one job at a time and hands it to the handler
pub struct JobConsumer<C: ContentStore, S: StatusStore> {
    config: Config,
    handler: JobHandler<C, S>,
    metrics: Metrics,
}

impl<C: ContentStore, S: StatusStore> JobConsumer<C, S> {
    pub fn new(config: Config, handler: JobHandler<C, S>, metrics: Metrics) -> Self {
        Self {
            config,
            handler,
            metrics,
        }
    }

    /// Runs the consumer loop. Returns only when a fatal error occurs.
    pub async fn run(&mut self, jetstream: &jetstream::Context) -> Result<()> {
        info!("Starting job consumer");

        let stream = self.ensure_stream(jetstream).await?;
        let consumer = self.create_consumer(&stream).await?;

        info!(
            consumer_name = %self.config.consumer_name,
            subject = %self.config.queue_subject,
            ack_wait_secs = self.config.ack_wait().as_secs(),
            "Consumer created successfully, waiting for jobs"
        );

        self.process_messages(consumer).await
    }

    /// Ensure the work-queue stream exists
    async fn ensure_stream(&self, jetstream: &jetstream::Context) -> Result<Stream> {
        let stream_name = &self.config.stream_name;

        match jetstream.get_stream(stream_name).await {
            Ok(stream) => {
                info!("Found existing stream: {}", stream_name);
                Ok(stream)
            }
            Err(_) => {
                info!("Stream {} not found, creating it", stream_name);
                let stream_config = jetstream::stream::Config {
                    name: stream_name.clone(),
                    subjects: vec![self.config.queue_subject.clone()],
                    retention: RetentionPolicy::WorkQueue,
                    ..Default::default()
                };

                let stream = jetstream
                    .get_or_create_stream(stream_config)
                    .await
                    .context("Failed to create JetStream stream")?;

                info!("Successfully created stream: {}", stream_name);
                Ok(stream)
            }
        }
    }

    /// Create the durable consumer shared by all workers
    async fn create_consumer(&self, stream: &Stream) -> Result<PullConsumer> {
        let consumer_config = jetstream::consumer::pull::Config {
            durable_name: Some(self.config.consumer_name.clone()),
            filter_subject: self.config.queue_subject.clone(),
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            ack_wait: self.config.ack_wait(),
            max_ack_pending: 1,
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&self.config.consumer_name, consumer_config)
            .await
            .context("Failed to create consumer")?;

        Ok(consumer)
    }

    async fn process_messages(&mut self, consumer: PullConsumer) -> Result<()> {
        loop {
            let mut messages = consumer
                .batch()
                .max_messages(1)
                .expires(Duration::from_secs(FETCH_EXPIRY_SECS))
                .messages()
                .await
                .context("Failed to fetch job")?;

            let mut received = 0;
            while let Some(msg_result) = messages.next().await {
                match msg_result {
                    Ok(msg) => {
                        received += 1;
                        self.handle_message(msg).await?;
                    }
                    Err(e) => {
                        error!("Error receiving message: {}", e);
                        self.metrics.record_error("receive_error");
                    }
                }
            }

            if received == 0 {
                debug!("No job available");
            }
        }
    }

    /// Handles one delivery. Acks only once the task record is written.
    async fn handle_message(&mut self, msg: jetstream::Message) -> Result<()> {
        debug!(
            subject = %msg.subject,
            payload_size = msg.payload.len(),
            "Processing job message"
        );

        let job: JobDescriptor = match serde_json::from_slice(&msg.payload) {
            Ok(job) => job,
            Err(e) => {
                error!(
                    subject = %msg.subject,
                    error = %e,
                    "Failed to deserialize job descriptor"
                );
                self.metrics.record_error("deserialization");
                // Ack malformed messages to avoid redelivery
                if let Err(ack_err) = msg.ack().await {
                    error!("Failed to ack malformed message: {}", ack_err);
                }
                return Ok(());
            }
        };

        match self.handler.process(&job).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                // Left unacked so another worker picks the job up after ack_wait.
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("Job {} aborted", job.task_id));
            }
            Err(e) => {
                warn!(
                    task_id = %job.task_id,
                    code = e.code(),
                    error = %e,
                    "Could not record task result, dropping job"
                );
            }
        }

        msg.ack()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to ack job {}: {}", job.task_id, e))?;
        debug!(task_id = %job.task_id, "Acked job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, PipelineSettings};
    use crate::store::{LocalContentStore, MemoryStatusStore};
    use crate::workspace::Workspace;
    use std::sync::Arc;

    #[test]
    fn test_consumer_creation() {
        let config = Config {
            consumer_name: "test-consumer".to_string(),
            ..Config::default()
        };
        let pipeline = Pipeline::new(
            Arc::new(LocalContentStore::new("/tmp/contra-store")),
            Workspace::new("/tmp/contra-ws"),
            PipelineSettings::from(&config),
            Metrics::new(),
        );
        let handler = JobHandler::new(pipeline, Arc::new(MemoryStatusStore::new()), Metrics::new());

        let consumer = JobConsumer::new(config, handler, Metrics::new());
        assert_eq!(consumer.config.consumer_name, "test-consumer");
    }
}
