//! Interface to interact with the compiler worker process.
//!
//! Compilation runs out of process: the server launches the compiler worker
//! executable once per request and folds its exit code and combined output
//! back into the request. [`CompilerCompileCmd`] builds the invocation:
//!
//! ```text
//! <worker_path> -compile <compiler_args> [-package]
//! ```
//!
//! The worker inherits the server's environment, runs without a console
//! window and its stdout and stderr are captured into a single log. Exit
//! codes translate through [`CompileExitStatus`]: `0` is success, `1` is
//! success with warnings, anything else is a failure.

use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Subcommand passed to the worker to request a compilation.
pub const COMMAND_NAME_COMPILE: &str = "-compile";
/// Flag appended for packaging-originated requests.
pub const COMMAND_ARG_PACKAGE: &str = "-package";

/// Launcher error.
#[derive(Error, Debug)]
pub enum CompilerCmdError {
    /// The worker process could not be spawned.
    #[error("compiler worker failed to start: {0}")]
    StartFailed(#[source] io::Error),
    /// The worker process could not be waited on.
    #[error("compiler worker failed to complete: {0}")]
    JoinFailed(#[source] io::Error),
}

/// Outcome of a compiler worker run, derived from its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileExitStatus {
    /// Exit code 0.
    Success,
    /// Exit code 1.
    SuccessWithWarnings,
    /// Any other exit code, or termination without one.
    Failed {
        /// The raw exit code, if the process exited with one.
        exit_code: Option<i32>,
    },
}

impl CompileExitStatus {
    /// Maps a raw exit code to an outcome.
    pub fn from_code(exit_code: Option<i32>) -> Self {
        match exit_code {
            Some(0) => Self::Success,
            Some(1) => Self::SuccessWithWarnings,
            other => Self::Failed { exit_code: other },
        }
    }

    /// Whether the run produced a usable artifact.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::SuccessWithWarnings)
    }
}

/// Output of a `compile` command.
#[derive(Debug)]
pub struct CompileCmdOutput {
    /// Outcome derived from the exit code.
    pub status: CompileExitStatus,
    /// Combined stdout and stderr of the worker.
    pub log: String,
}

/// Represents a command-line call along with its arguments.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
struct CommandBuilder {
    command: PathBuf,
    args: Vec<String>,
}

impl CommandBuilder {
    fn set_command(&mut self, path: impl AsRef<OsStr>) -> &mut Self {
        self.command = PathBuf::from(path.as_ref());
        self
    }

    fn arg(&mut self, arg: &str) -> &mut Self {
        if !arg.is_empty() {
            self.args.push(arg.to_owned());
        }
        self
    }

    /// Spawns the process and waits for it, capturing stdout and stderr.
    async fn exec(&self) -> Result<(Option<i32>, String), CompilerCmdError> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let child = command.spawn().map_err(CompilerCmdError::StartFailed)?;
        info!("compiler worker started: {:?} {:?}", self.command, self.args);

        let output = child
            .wait_with_output()
            .await
            .map_err(CompilerCmdError::JoinFailed)?;

        // The worker writes diagnostics to both streams; they are combined
        // into one log, stdout first.
        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        debug!("compiler worker exited with {:?}", output.status.code());
        Ok((output.status.code(), log))
    }
}

/// Helper building a `compile` command.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CompilerCompileCmd(CommandBuilder);

impl CompilerCompileCmd {
    /// Creates a new command.
    ///
    /// `package` adds the packaging flag for package-originated requests.
    pub fn new(worker_path: impl AsRef<Path>, compiler_args: &str, package: bool) -> Self {
        let mut builder = CommandBuilder::default();
        builder
            .set_command(worker_path.as_ref())
            .arg(COMMAND_NAME_COMPILE)
            .arg(compiler_args);
        if package {
            builder.arg(COMMAND_ARG_PACKAGE);
        }
        Self(builder)
    }

    /// Create a new command from a .json string.
    pub fn from_slice(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Serialize the command into a .json string.
    #[allow(clippy::inherent_to_string)]
    pub fn to_string(&self) -> String {
        serde_json::to_string_pretty(self).unwrap()
    }

    /// Runs the worker process, waits for completion and returns its outcome
    /// together with the combined output. There is no per-request timeout; a
    /// hung worker blocks its caller indefinitely.
    pub async fn execute(&self) -> Result<CompileCmdOutput, CompilerCmdError> {
        let (exit_code, log) = self.0.exec().await?;
        Ok(CompileCmdOutput {
            status: CompileExitStatus::from_code(exit_code),
            log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{CompileExitStatus, CompilerCompileCmd};

    #[test]
    fn exit_code_mapping() {
        assert_eq!(
            CompileExitStatus::from_code(Some(0)),
            CompileExitStatus::Success
        );
        assert_eq!(
            CompileExitStatus::from_code(Some(1)),
            CompileExitStatus::SuccessWithWarnings
        );
        assert_eq!(
            CompileExitStatus::from_code(Some(2)),
            CompileExitStatus::Failed { exit_code: Some(2) }
        );
        assert_eq!(
            CompileExitStatus::from_code(None),
            CompileExitStatus::Failed { exit_code: None }
        );
        assert!(CompileExitStatus::from_code(Some(1)).is_success());
        assert!(!CompileExitStatus::from_code(Some(-1)).is_success());
    }

    #[test]
    fn command_line_shape() {
        let cmd = CompilerCompileCmd::new("/tools/worker", "chars/hero/run.anim", false);
        let json = cmd.to_string();
        let parsed = CompilerCompileCmd::from_slice(&json).unwrap();
        assert_eq!(parsed.0.args, vec!["-compile", "chars/hero/run.anim"]);

        let packaged = CompilerCompileCmd::new("/tools/worker", "maps/town.map", true);
        assert_eq!(
            packaged.0.args,
            vec!["-compile", "maps/town.map", "-package"]
        );
    }

    #[cfg(unix)]
    mod subprocess {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        use super::super::{CompileExitStatus, CompilerCmdError, CompilerCompileCmd};

        fn fake_worker(dir: &std::path::Path, script: &str) -> std::path::PathBuf {
            let path = dir.join("worker.sh");
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh").unwrap();
            writeln!(file, "{}", script).unwrap();
            drop(file);
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn captures_combined_output() {
            let work_dir = tempfile::tempdir().unwrap();
            let worker = fake_worker(work_dir.path(), "echo out-line; echo err-line 1>&2; exit 0");

            let output = CompilerCompileCmd::new(&worker, "a.anim", false)
                .execute()
                .await
                .unwrap();
            assert_eq!(output.status, CompileExitStatus::Success);
            assert!(output.log.contains("out-line"));
            assert!(output.log.contains("err-line"));
        }

        #[tokio::test]
        async fn warning_exit_code() {
            let work_dir = tempfile::tempdir().unwrap();
            let worker = fake_worker(work_dir.path(), "echo warning: downsampled; exit 1");

            let output = CompilerCompileCmd::new(&worker, "tex/logo.tex", false)
                .execute()
                .await
                .unwrap();
            assert_eq!(output.status, CompileExitStatus::SuccessWithWarnings);
            assert!(output.log.contains("warning: downsampled"));
        }

        #[tokio::test]
        async fn missing_worker_fails_to_start() {
            let result = CompilerCompileCmd::new("/nonexistent/worker", "a.anim", false)
                .execute()
                .await;
            assert!(matches!(result, Err(CompilerCmdError::StartFailed(_))));
        }
    }
}
