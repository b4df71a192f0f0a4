//! Extension-driven archive unpack/pack dispatch.
//!
//! Archives are handled by external tools (`tar`, `7za`). Selection is a pure
//! function of the final file extension, so `data.tar.gz` is a gzip tarball
//! and `data.xyz` has no command at all.

use crate::error::JobError;
use crate::sandbox::{run_captured, truncate};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

const TOOL_OUTPUT_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    SevenZip,
}

impl ArchiveFormat {
    /// Format implied by the last extension of `filename`, case-insensitive.
    pub fn from_filename(filename: impl AsRef<Path>) -> Option<Self> {
        let ext = filename.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "tar" => Some(ArchiveFormat::Tar),
            "gz" | "gzip" => Some(ArchiveFormat::TarGz),
            "7z" | "7zip" => Some(ArchiveFormat::SevenZip),
            _ => None,
        }
    }

    pub fn can_pack(self) -> bool {
        !matches!(self, ArchiveFormat::SevenZip)
    }
}

/// A fully specified tool invocation, not yet run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
}

impl ExternalCommand {
    fn new(program: &str, working_dir: &Path) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            working_dir: working_dir.to_path_buf(),
        }
    }

    fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_escape(&arg.to_string_lossy()));
        }
        line
    }

    /// Runs the tool to completion and returns its combined output.
    /// A non-zero exit is an [`JobError::ExternalTool`].
    pub fn run(&self) -> Result<Vec<u8>, JobError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).current_dir(&self.working_dir);

        let captured = run_captured(&mut command, None).map_err(|err| JobError::ExternalTool {
            tool: self.program.clone(),
            status: "spawn failure".to_string(),
            output: err.to_string(),
        })?;
        let text = String::from_utf8_lossy(&captured.output);

        match captured.status {
            Some(status) if status.success() => {
                info!(
                    command = %self.command_line(),
                    output = %truncate(text.trim_end(), TOOL_OUTPUT_LIMIT),
                    "Tool finished"
                );
                Ok(captured.output)
            }
            other => {
                let status = other
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown status".to_string());
                warn!(
                    command = %self.command_line(),
                    status = %status,
                    output = %truncate(text.trim_end(), TOOL_OUTPUT_LIMIT),
                    "Tool failed"
                );
                Err(JobError::ExternalTool {
                    tool: self.program.clone(),
                    status,
                    output: truncate(text.trim_end(), TOOL_OUTPUT_LIMIT),
                })
            }
        }
    }
}

/// Extraction command for `archive`, run inside `workdir`.
pub fn select_unpack(archive: &Path, workdir: &Path) -> Option<ExternalCommand> {
    let command = match ArchiveFormat::from_filename(archive)? {
        ArchiveFormat::Tar => ExternalCommand::new("tar", workdir).arg("-xf"),
        ArchiveFormat::TarGz => ExternalCommand::new("tar", workdir).arg("-xzf"),
        ArchiveFormat::SevenZip => ExternalCommand::new("7za", workdir).arg("x"),
    };
    Some(command.arg(archive.as_os_str()))
}

/// Command that writes `archive_name` from `dir_to_pack`, both relative to
/// `workdir`. 7-Zip output is not supported.
pub fn select_pack(archive_name: &str, dir_to_pack: &str, workdir: &Path) -> Option<ExternalCommand> {
    let flag = match ArchiveFormat::from_filename(archive_name)? {
        ArchiveFormat::Tar => "-cf",
        ArchiveFormat::TarGz => "-czf",
        ArchiveFormat::SevenZip => return None,
    };
    Some(
        ExternalCommand::new("tar", workdir)
            .arg(flag)
            .arg(archive_name)
            .arg(dir_to_pack),
    )
}

/// Unpacks `archive` into `workdir`.
pub fn unpack(archive: &Path, workdir: &Path) -> Result<(), JobError> {
    let command = select_unpack(archive, workdir).ok_or_else(|| JobError::UnsupportedFormat {
        filename: display_name(archive),
    })?;
    command.run().map(|_| ())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    if !arg.contains([' ', '"', '\'']) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn args(cmd: &ExternalCommand) -> Vec<String> {
        cmd.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_format_from_last_extension() {
        assert_eq!(
            ArchiveFormat::from_filename("data.tar.gz"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::from_filename("DATA.GZIP"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(ArchiveFormat::from_filename("a.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(
            ArchiveFormat::from_filename("a.7zip"),
            Some(ArchiveFormat::SevenZip)
        );
        assert_eq!(ArchiveFormat::from_filename("data.xyz"), None);
        assert_eq!(ArchiveFormat::from_filename("Makefile"), None);
    }

    #[test]
    fn test_unpack_selection() {
        let work = Path::new("/ws/run");
        let gz = select_unpack(Path::new("/ws/src/data.tar.gz"), work).unwrap();
        assert_eq!(gz.program, "tar");
        assert_eq!(args(&gz), vec!["-xzf", "/ws/src/data.tar.gz"]);
        assert_eq!(gz.working_dir, work);

        let tar = select_unpack(Path::new("/ws/src/data.tar"), work).unwrap();
        assert_eq!(args(&tar), vec!["-xf", "/ws/src/data.tar"]);

        let seven = select_unpack(Path::new("/ws/src/data.7z"), work).unwrap();
        assert_eq!(seven.program, "7za");
        assert_eq!(args(&seven), vec!["x", "/ws/src/data.7z"]);

        assert!(select_unpack(Path::new("/ws/src/data.xyz"), work).is_none());
    }

    #[test]
    fn test_pack_selection() {
        let out = Path::new("/ws/out");
        let gz = select_pack("output.tar.gz", "run", out).unwrap();
        assert_eq!(args(&gz), vec!["-czf", "output.tar.gz", "run"]);
        let tar = select_pack("output.tar", "run", out).unwrap();
        assert_eq!(args(&tar), vec!["-cf", "output.tar", "run"]);
        assert!(select_pack("output.7z", "run", out).is_none());
        assert!(select_pack("output.zip", "run", out).is_none());
    }

    #[test]
    fn test_command_line_quotes_spaces() {
        let cmd = select_unpack(Path::new("/tmp/my data.tar"), Path::new("/tmp")).unwrap();
        assert_eq!(cmd.command_line(), "tar -xf '/tmp/my data.tar'");
    }

    #[test]
    fn test_unsupported_unpack_is_reported() {
        let err = unpack(Path::new("/tmp/data.rar"), Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, JobError::UnsupportedFormat { filename } if filename == "data.rar"));
    }

    #[test]
    fn test_pack_then_unpack_with_tar() {
        let temp = tempfile::tempdir().unwrap();
        let staging = temp.path().join("staging");
        fs::create_dir_all(staging.join("run/sub")).unwrap();
        fs::write(staging.join("run/sub/file.txt"), "payload").unwrap();

        select_pack("bundle.tar.gz", "run", &staging)
            .unwrap()
            .run()
            .unwrap();

        let target = temp.path().join("target");
        fs::create_dir_all(&target).unwrap();
        unpack(&staging.join("bundle.tar.gz"), &target).unwrap();
        assert_eq!(
            fs::read_to_string(target.join("run/sub/file.txt")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn test_failing_tool_is_external_tool_error() {
        let temp = tempfile::tempdir().unwrap();
        let bogus = temp.path().join("broken.tar");
        fs::write(&bogus, "this is not a tarball").unwrap();

        let err = unpack(&bogus, temp.path()).unwrap_err();
        assert!(matches!(err, JobError::ExternalTool { ref tool, .. } if tool == "tar"));
    }
}
