//! Per-job execution pipeline
//!
//! ```text
//! Preparing -> Retrieving -> Unpacking -> Placing -> SnapshotBefore
//!   -> Executing -> SnapshotAfter -> Diffing -> Packaging
//! ```
//!
//! Packaging is skipped when nothing changed. With `collect_output` off the
//! snapshot, diff and packaging stages are skipped entirely. Filesystem and
//! subprocess stages run on the blocking pool; transfers stay async.

use crate::archive;
use crate::error::{JobError, ScriptError};
use crate::metrics::Metrics;
use crate::payload::{locate_payload_root, place_control_script};
use crate::sandbox::{normalize_line_endings, run_script, SandboxSettings};
use crate::store::{Collection, ContentStore};
use crate::workspace::Workspace;
use crate::Config;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preparing,
    Retrieving,
    Unpacking,
    Placing,
    SnapshotBefore,
    Executing,
    SnapshotAfter,
    Diffing,
    Packaging,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preparing => "preparing",
            Stage::Retrieving => "retrieving",
            Stage::Unpacking => "unpacking",
            Stage::Placing => "placing",
            Stage::SnapshotBefore => "snapshot_before",
            Stage::Executing => "executing",
            Stage::SnapshotAfter => "snapshot_after",
            Stage::Diffing => "diffing",
            Stage::Packaging => "packaging",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job that stopped at `stage`.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    pub source: JobError,
    /// Script output, when the failure came after the script ran.
    pub output: Option<Vec<u8>>,
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        self.source.is_fatal()
    }

    pub fn output_text(&self) -> String {
        self.output
            .as_deref()
            .map(|output| String::from_utf8_lossy(output).into_owned())
            .unwrap_or_default()
    }

    fn with_output(mut self, output: &[u8]) -> Self {
        self.output = Some(output.to_vec());
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub sandbox: SandboxSettings,
    /// File name of the output archive; its extension selects the format.
    pub archive_name: String,
    pub collect_output: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sandbox: SandboxSettings::default(),
            archive_name: "output.tar.gz".to_string(),
            collect_output: true,
        }
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            sandbox: config.sandbox_settings(),
            archive_name: config.output_archive_name.clone(),
            collect_output: config.collect_output,
        }
    }
}

/// Result of a completed job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Combined stdout and stderr of the control script.
    pub output: Vec<u8>,
    /// Archive of new or changed files, if there were any.
    pub artifact: Option<PathBuf>,
    pub script_error: Option<ScriptError>,
}

impl JobOutcome {
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

pub struct Pipeline<C: ContentStore> {
    store: Arc<C>,
    workspace: Workspace,
    settings: PipelineSettings,
    metrics: Metrics,
}

impl<C: ContentStore> Pipeline<C> {
    pub fn new(
        store: Arc<C>,
        workspace: Workspace,
        settings: PipelineSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            workspace,
            settings,
            metrics,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<C> {
        &self.store
    }

    /// Runs one job end to end.
    ///
    /// Takes `&mut self`: a workspace holds exactly one job at a time.
    pub async fn execute(
        &mut self,
        data_fid: &str,
        control_fid: &str,
    ) -> Result<JobOutcome, PipelineError> {
        info!(data_fid, control_fid, "Starting job");
        let started = Instant::now();

        let workspace = self.workspace.clone();
        self.stage(Stage::Preparing, blocking(move || workspace.prepare()))
            .await?;

        let (data_path, control_path) = self
            .stage(Stage::Retrieving, self.retrieve(data_fid, control_fid))
            .await?;

        let run_dir = self.workspace.run_dir();
        let (archive, workdir) = (data_path.clone(), run_dir.clone());
        self.stage(
            Stage::Unpacking,
            blocking(move || archive::unpack(&archive, &workdir)),
        )
        .await?;

        let (script, root) = (control_path.clone(), run_dir.clone());
        let (payload_root, script_name) = self
            .stage(
                Stage::Placing,
                blocking(move || {
                    let payload_root = locate_payload_root(&root)?;
                    let placed = place_control_script(&script, &payload_root)?;
                    Ok((payload_root, file_name(&placed)))
                }),
            )
            .await?;

        let before = if self.settings.collect_output {
            let root = run_dir.clone();
            Some(
                self.stage(Stage::SnapshotBefore, blocking(move || Ok(fstree::snapshot(&root)?)))
                    .await?,
            )
        } else {
            None
        };

        let sandbox = self.settings.sandbox.clone();
        let script_run = self
            .stage(
                Stage::Executing,
                blocking(move || Ok(run_script(&payload_root, &script_name, &sandbox))),
            )
            .await?;

        let artifact = match before {
            Some(before) => self
                .collect(&run_dir, before)
                .await
                .map_err(|err| err.with_output(&script_run.output))?,
            None => None,
        };

        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            artifact = artifact.as_ref().map(|path| path.display().to_string()),
            script_error = script_run.error.as_ref().map(|err| err.to_string()),
            "Job finished"
        );

        Ok(JobOutcome {
            output: script_run.output,
            artifact,
            script_error: script_run.error,
        })
    }

    async fn retrieve(
        &self,
        data_fid: &str,
        control_fid: &str,
    ) -> Result<(PathBuf, PathBuf), JobError> {
        let data_path = self.fetch(Collection::Data, data_fid).await?;
        let control_path = self.fetch(Collection::Control, control_fid).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&control_path, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|err| JobError::filesystem(&control_path, err))?;
        }

        let script = control_path.clone();
        let converted = blocking(move || normalize_line_endings(&script)).await?;
        debug!(
            data = %data_path.display(),
            control = %control_path.display(),
            crlf_converted = converted,
            "Retrieved job inputs"
        );
        Ok((data_path, control_path))
    }

    /// Downloads into a per-collection directory under `src` so a data file and
    /// a control script with the same name cannot collide.
    async fn fetch(&self, collection: Collection, file_id: &str) -> Result<PathBuf, JobError> {
        let dir = self.workspace.src_dir().join(collection.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| JobError::filesystem(&dir, err))?;
        let descriptor = self
            .store
            .download(collection, file_id, &dir)
            .await
            .map_err(|err| err.into_job_error(collection.as_str(), file_id))?;
        Ok(dir.join(descriptor.filename))
    }

    async fn collect(
        &self,
        run_dir: &Path,
        before: fstree::FileTree,
    ) -> Result<Option<PathBuf>, PipelineError> {
        let root = run_dir.to_path_buf();
        let after = self
            .stage(Stage::SnapshotAfter, blocking(move || Ok(fstree::snapshot(&root)?)))
            .await?;

        let changes = self
            .stage(Stage::Diffing, async { Ok(fstree::diff(&before, &after)) })
            .await?;
        let Some(changes) = changes else {
            info!("No files changed, skipping packaging");
            return Ok(None);
        };
        debug!(
            changed_files = changes.file_count(),
            entries = changes.len(),
            "Computed diff"
        );

        let source_root = run_dir.to_path_buf();
        let staging = self.workspace.out_dir();
        let archive_name = self.settings.archive_name.clone();
        let artifact = self
            .stage(
                Stage::Packaging,
                blocking(move || {
                    crate::packager::package(&source_root, &changes, &staging, &archive_name)
                }),
            )
            .await?;
        Ok(Some(artifact))
    }

    async fn stage<T>(
        &self,
        stage: Stage,
        work: impl Future<Output = Result<T, JobError>>,
    ) -> Result<T, PipelineError> {
        debug!(stage = %stage, "Entering stage");
        let start = Instant::now();
        let result = work.await;
        self.metrics.record_stage(stage.as_str(), start.elapsed());
        result.map_err(|source| {
            self.metrics.record_error(source.code());
            PipelineError {
                stage,
                source,
                output: None,
            }
        })
    }
}

async fn blocking<T, F>(work: F) -> Result<T, JobError>
where
    F: FnOnce() -> Result<T, JobError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|err| JobError::Filesystem {
        path: PathBuf::new(),
        source: std::io::Error::other(format!("blocking task failed: {}", err)),
    })?
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalContentStore;

    #[test]
    fn test_stage_names_are_snake_case() {
        assert_eq!(Stage::SnapshotBefore.to_string(), "snapshot_before");
        assert_eq!(Stage::Packaging.as_str(), "packaging");
    }

    #[test]
    fn test_settings_follow_config() {
        let config = Config {
            script_timeout_secs: 0,
            collect_output: false,
            output_archive_name: "result.tar".to_string(),
            ..Config::default()
        };
        let settings = PipelineSettings::from(&config);
        assert!(settings.sandbox.timeout.is_none());
        assert!(!settings.collect_output);
        assert_eq!(settings.archive_name, "result.tar");
    }

    #[tokio::test]
    async fn test_missing_data_fails_in_retrieval() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalContentStore::new(temp.path().join("store")));
        let mut pipeline = Pipeline::new(
            store,
            Workspace::new(temp.path().join("ws")),
            PipelineSettings::default(),
            Metrics::new(),
        );

        let err = pipeline.execute("nope", "nope").await.unwrap_err();
        assert_eq!(err.stage, Stage::Retrieving);
        assert!(matches!(err.source, JobError::Retrieval { .. }));
        assert!(!err.is_fatal());
    }
}
