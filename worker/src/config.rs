//! Configuration for the execution worker

use crate::sandbox::SandboxSettings;
use crate::store::jetstream::ContentBuckets;
use anyhow::{bail, Result};
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Extra time on top of the script timeout before JetStream redelivers a job.
const ACK_WAIT_MARGIN_SECS: u64 = 300;

/// Longest script timeout accepted: one week.
const MAX_SCRIPT_TIMEOUT_SECS: u64 = 7 * 24 * 3600;

/// Configuration for the execution worker
#[derive(Debug, Clone, Parser)]
#[command(name = "contra-exec")]
#[command(about = "Runs queued control scripts against data bundles and archives what changed")]
pub struct Config {
    /// NATS server URL
    #[arg(long, env, default_value = "nats://localhost:4222")]
    pub nats_url: String,

    /// Path to NATS credentials file (takes precedence over user/password)
    #[arg(long, env)]
    pub nats_creds_path: Option<String>,

    /// NATS user name
    #[arg(long, env, default_value = "guest")]
    pub nats_user: String,

    /// NATS password
    #[arg(long, env, default_value = "guest", hide_env_values = true)]
    pub nats_password: String,

    /// Worker identity, used as the NATS connection name
    #[arg(long, env = "CLIENT_ID", default_value = "contra-exec")]
    pub client_id: String,

    /// JetStream stream holding queued jobs
    #[arg(long, env, default_value = "EXECUTION")]
    pub stream_name: String,

    /// Subject jobs are published on
    #[arg(long, env, default_value = "execution_queue")]
    pub queue_subject: String,

    /// Durable consumer shared by all workers
    #[arg(long, env, default_value = "contra-exec")]
    pub consumer_name: String,

    /// Object store bucket with input data bundles
    #[arg(long, env, default_value = "data")]
    pub data_bucket: String,

    /// Object store bucket with control scripts
    #[arg(long, env, default_value = "control")]
    pub control_bucket: String,

    /// Object store bucket receiving output archives
    #[arg(long, env, default_value = "output")]
    pub output_bucket: String,

    /// Key/value bucket with task records
    #[arg(long, env, default_value = "tasks")]
    pub tasks_bucket: String,

    /// Directory wiped and rebuilt for every job
    #[arg(long, env, default_value = "/home/contra/exec_dir")]
    pub workspace_root: PathBuf,

    /// Interpreter the control script is run with
    #[arg(long, env, default_value = "/bin/bash")]
    pub shell: PathBuf,

    /// Wall-clock limit for the control script in seconds (0 disables)
    #[arg(long, env, default_value_t = 3600)]
    pub script_timeout_secs: u64,

    /// Name of the archive produced from changed files
    #[arg(long, env, default_value = "output.tar.gz")]
    pub output_archive_name: String,

    /// Snapshot, diff and package changed files after the script runs
    #[arg(
        long,
        env,
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_name = "BOOL"
    )]
    pub collect_output: bool,

    /// Read inputs from this directory instead of JetStream (run-once mode)
    #[arg(long, env)]
    pub content_dir: Option<PathBuf>,

    /// Output logs in JSON format
    #[arg(long, env)]
    pub log_json: bool,

    /// Data file id; runs a single job and exits
    #[arg(requires = "control_fid")]
    pub data_fid: Option<String>,

    /// Control file id; runs a single job and exits
    #[arg(requires = "data_fid")]
    pub control_fid: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nats_url: env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            nats_creds_path: env::var("NATS_CREDS_PATH").ok(),
            nats_user: env::var("NATS_USER").unwrap_or_else(|_| "guest".to_string()),
            nats_password: env::var("NATS_PASSWORD").unwrap_or_else(|_| "guest".to_string()),
            client_id: env::var("CLIENT_ID").unwrap_or_else(|_| "contra-exec".to_string()),
            stream_name: "EXECUTION".to_string(),
            queue_subject: "execution_queue".to_string(),
            consumer_name: "contra-exec".to_string(),
            data_bucket: "data".to_string(),
            control_bucket: "control".to_string(),
            output_bucket: "output".to_string(),
            tasks_bucket: "tasks".to_string(),
            workspace_root: env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/home/contra/exec_dir")),
            shell: PathBuf::from("/bin/bash"),
            script_timeout_secs: env::var("SCRIPT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .unwrap_or(3600),
            output_archive_name: "output.tar.gz".to_string(),
            collect_output: true,
            content_dir: None,
            log_json: env::var("LOG_JSON")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            data_fid: None,
            control_fid: None,
        }
    }
}

impl Config {
    /// Parse configuration from command-line args and environment variables
    pub fn parse_config() -> Self {
        Config::parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.workspace_root.as_os_str().is_empty() {
            bail!("workspace root must not be empty");
        }
        if self.workspace_root.parent().is_none() {
            bail!(
                "refusing to use {} as workspace root: it is wiped before every job",
                self.workspace_root.display()
            );
        }
        if crate::archive::select_pack(&self.output_archive_name, "run", &self.workspace_root)
            .is_none()
        {
            bail!(
                "output archive name '{}' has no supported pack format",
                self.output_archive_name
            );
        }
        if self.queue_subject.trim().is_empty() {
            bail!("queue subject must not be empty");
        }
        if self.script_timeout_secs > MAX_SCRIPT_TIMEOUT_SECS {
            bail!(
                "script timeout of {}s exceeds the {}s maximum",
                self.script_timeout_secs,
                MAX_SCRIPT_TIMEOUT_SECS
            );
        }
        Ok(())
    }

    /// Both file ids, when the worker was started for a single job.
    pub fn run_once(&self) -> Option<(&str, &str)> {
        match (&self.data_fid, &self.control_fid) {
            (Some(data), Some(control)) => Some((data, control)),
            _ => None,
        }
    }

    pub fn script_timeout(&self) -> Option<Duration> {
        (self.script_timeout_secs > 0).then(|| Duration::from_secs(self.script_timeout_secs))
    }

    pub fn sandbox_settings(&self) -> SandboxSettings {
        SandboxSettings {
            shell: self.shell.clone(),
            timeout: self.script_timeout(),
        }
    }

    pub fn content_buckets(&self) -> ContentBuckets {
        ContentBuckets {
            data: self.data_bucket.clone(),
            control: self.control_bucket.clone(),
            output: self.output_bucket.clone(),
        }
    }

    /// How long a delivered job may stay unacknowledged.
    ///
    /// Always longer than the script timeout, so a job still running is not
    /// handed to another worker.
    pub fn ack_wait(&self) -> Duration {
        let base = if self.script_timeout_secs == 0 {
            24 * 3600
        } else {
            self.script_timeout_secs
        };
        Duration::from_secs(base.saturating_add(ACK_WAIT_MARGIN_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            workspace_root: PathBuf::from("/tmp/contra-test"),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream_name, "EXECUTION");
        assert_eq!(config.queue_subject, "execution_queue");
        assert!(config.collect_output);
        assert!(config.run_once().is_none());
    }

    #[test]
    fn test_filesystem_root_is_rejected() {
        let config = Config {
            workspace_root: PathBuf::from("/"),
            ..config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unpackable_archive_name_is_rejected() {
        let config = Config {
            output_archive_name: "output.7z".to_string(),
            ..config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_disables_limit() {
        let mut config = config();
        config.script_timeout_secs = 0;
        assert!(config.sandbox_settings().timeout.is_none());
        assert!(config.ack_wait() > Duration::from_secs(24 * 3600));

        config.script_timeout_secs = 60;
        assert_eq!(config.script_timeout(), Some(Duration::from_secs(60)));
        assert!(config.ack_wait() > Duration::from_secs(60));
    }

    #[test]
    fn test_huge_timeout_is_rejected_without_overflow() {
        let config = Config {
            script_timeout_secs: u64::MAX,
            ..config()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.ack_wait(), Duration::from_secs(u64::MAX));

        let week = Config {
            script_timeout_secs: MAX_SCRIPT_TIMEOUT_SECS,
            ..self::config()
        };
        assert!(week.validate().is_ok());
    }

    #[test]
    fn test_positional_ids_select_run_once() {
        let config = Config::try_parse_from([
            "contra-exec",
            "--workspace-root",
            "/tmp/contra-test",
            "data-1",
            "control-1",
        ])
        .unwrap();
        assert_eq!(config.run_once(), Some(("data-1", "control-1")));
    }

    #[test]
    fn test_single_positional_id_is_an_error() {
        assert!(Config::try_parse_from(["contra-exec", "data-1"]).is_err());
    }

    #[test]
    fn test_collect_output_can_be_disabled() {
        let config =
            Config::try_parse_from(["contra-exec", "--collect-output", "false"]).unwrap();
        assert!(!config.collect_output);
    }
}
