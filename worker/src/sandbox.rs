//! Subprocess execution with combined output capture.
//!
//! stdout and stderr of the child share one anonymous temp file, so the bytes
//! land in the order the OS saw the writes, and a chatty child can never block
//! on a full pipe.

use crate::error::{JobError, ScriptError};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// How the control script is launched.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub shell: PathBuf,
    /// Wall-clock limit. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/bash"),
            timeout: Some(Duration::from_secs(3600)),
        }
    }
}

/// Result of one control script invocation.
#[derive(Debug, Clone)]
pub struct ScriptRun {
    pub output: Vec<u8>,
    pub error: Option<ScriptError>,
    pub duration: Duration,
}

/// Runs `script_name` with the configured shell inside `working_dir`.
///
/// The captured output is returned even when the script fails or times out.
pub fn run_script(working_dir: &Path, script_name: &str, settings: &SandboxSettings) -> ScriptRun {
    let mut command = Command::new(&settings.shell);
    command
        .arg(working_dir.join(script_name))
        .current_dir(working_dir)
        .stdin(Stdio::null());

    info!(
        working_dir = %working_dir.display(),
        script = script_name,
        timeout_secs = settings.timeout.map(|t| t.as_secs()),
        "Running control script"
    );

    let start = Instant::now();
    let captured = run_captured(&mut command, settings.timeout);
    let duration = start.elapsed();

    let (output, error) = match captured {
        Ok(Captured {
            output,
            status: Some(status),
        }) if status.success() => (output, None),
        Ok(Captured {
            output,
            status: Some(status),
        }) => (
            output,
            Some(ScriptError::ExitStatus {
                code: status.code(),
            }),
        ),
        Ok(Captured {
            output,
            status: None,
        }) => (
            output,
            Some(ScriptError::Timeout {
                limit_secs: settings.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            }),
        ),
        Err(err) => (
            Vec::new(),
            Some(ScriptError::Spawn {
                message: err.to_string(),
            }),
        ),
    };

    match &error {
        None => info!(
            duration_ms = duration.as_millis() as u64,
            output_bytes = output.len(),
            "Control script finished"
        ),
        Some(err) => warn!(
            duration_ms = duration.as_millis() as u64,
            output_bytes = output.len(),
            error = %err,
            "Control script did not succeed"
        ),
    }

    ScriptRun {
        output,
        error,
        duration,
    }
}

/// Rewrites CRLF line endings to LF in place.
pub fn normalize_line_endings(path: &Path) -> Result<bool, JobError> {
    let bytes = fs::read(path).map_err(|err| JobError::filesystem(path, err))?;
    if !bytes.windows(2).any(|pair| pair == b"\r\n") {
        return Ok(false);
    }

    let mut normalized = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().peekable();
    while let Some(&byte) = iter.next() {
        if byte == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        normalized.push(byte);
    }

    fs::write(path, &normalized).map_err(|err| JobError::filesystem(path, err))?;
    debug!(path = %path.display(), "Normalized CRLF line endings");
    Ok(true)
}

/// Output of a finished or killed child. `status` is `None` after a timeout.
#[derive(Debug)]
pub(crate) struct Captured {
    pub output: Vec<u8>,
    pub status: Option<ExitStatus>,
}

pub(crate) fn run_captured(command: &mut Command, timeout: Option<Duration>) -> io::Result<Captured> {
    let mut sink = tempfile::tempfile()?;
    command
        .stdout(Stdio::from(sink.try_clone()?))
        .stderr(Stdio::from(sink.try_clone()?));

    // Own process group, so a timeout takes the script's children down too.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    let status = match timeout {
        Some(limit) => match child.wait_timeout(limit)? {
            Some(status) => Some(status),
            None => {
                kill_tree(&mut child);
                child.wait()?;
                None
            }
        },
        None => Some(child.wait()?),
    };

    sink.seek(SeekFrom::Start(0))?;
    let mut output = Vec::new();
    sink.read_to_end(&mut output)?;
    Ok(Captured { output, status })
}

fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        // SAFETY: plain kill(2) on the process group we created at spawn.
        let rc = unsafe { libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL) };
        if rc == 0 {
            return;
        }
    }
    if let Err(err) = child.kill() {
        warn!(pid = child.id(), error = %err, "Failed to kill timed out process");
    }
}

pub(crate) fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = text[..end].to_string();
    truncated.push_str("… (truncated)");
    truncated
}
