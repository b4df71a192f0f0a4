//! contra-exec binary - consumes queued jobs, or runs a single job when given
//! `DATA_FID CONTROL_FID`

use anyhow::Context;
use async_nats::jetstream;
use contra_exec::store::{JetStreamContentStore, JetStreamStatusStore, LocalContentStore};
use contra_exec::{
    consumer, Config, ContentStore, JobConsumer, JobHandler, Metrics, Pipeline, PipelineSettings,
    Workspace,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse_config();

    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }

    config.validate()?;

    info!("Starting contra-exec");
    info!("Configuration:");
    info!("  Client ID: {}", config.client_id);
    info!("  Workspace: {}", config.workspace_root.display());
    info!("  Script timeout: {}s", config.script_timeout_secs);
    info!("  Output archive: {}", config.output_archive_name);
    info!("  Collect output: {}", config.collect_output);

    let metrics = Metrics::new();

    if let Some((data_fid, control_fid)) = config.run_once() {
        let (data_fid, control_fid) = (data_fid.to_string(), control_fid.to_string());
        return match &config.content_dir {
            Some(dir) => {
                info!("Using local content store at {}", dir.display());
                let store = Arc::new(LocalContentStore::new(dir));
                run_once(&config, store, &data_fid, &control_fid, metrics).await
            }
            None => {
                let jetstream = jetstream::new(consumer::connect(&config).await?);
                let store =
                    Arc::new(JetStreamContentStore::open(&jetstream, &config.content_buckets()).await?);
                run_once(&config, store, &data_fid, &control_fid, metrics).await
            }
        };
    }

    info!("  NATS URL: {}", config.nats_url);
    info!("  Stream: {}", config.stream_name);
    info!("  Subject: {}", config.queue_subject);
    info!("  Consumer: {}", config.consumer_name);

    let jetstream = jetstream::new(consumer::connect(&config).await?);
    let content_store =
        Arc::new(JetStreamContentStore::open(&jetstream, &config.content_buckets()).await?);
    let status_store = Arc::new(JetStreamStatusStore::open(&jetstream, &config.tasks_bucket).await?);

    let pipeline = Pipeline::new(
        content_store,
        Workspace::new(&config.workspace_root),
        PipelineSettings::from(&config),
        metrics.clone(),
    );
    let handler = JobHandler::new(pipeline, status_store, metrics.clone());
    let mut job_consumer = JobConsumer::new(config, handler, metrics);

    match job_consumer.run(&jetstream).await {
        Ok(()) => {
            info!("Job consumer exited normally");
            Ok(())
        }
        Err(e) => {
            error!("Job consumer failed: {:#}", e);
            Err(e)
        }
    }
}

/// Runs one job and prints `(output, artifact, error)`.
async fn run_once<C: ContentStore>(
    config: &Config,
    store: Arc<C>,
    data_fid: &str,
    control_fid: &str,
    metrics: Metrics,
) -> anyhow::Result<()> {
    let mut pipeline = Pipeline::new(
        store,
        Workspace::new(&config.workspace_root),
        PipelineSettings::from(config),
        metrics,
    );

    let outcome = pipeline
        .execute(data_fid, control_fid)
        .await
        .with_context(|| format!("Job {} / {} failed", data_fid, control_fid))?;

    let artifact = outcome
        .artifact
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    let error = outcome
        .script_error
        .as_ref()
        .map(|err| err.to_string())
        .unwrap_or_default();
    println!("({:?}, {:?}, {:?})", outcome.output_text(), artifact, error);
    Ok(())
}
