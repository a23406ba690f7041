use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;

/// Default upper bound for a single subprocess.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised while running a subprocess.
///
/// A non-zero exit status is not an error here; callers inspect
/// [`CommandOutput::success`].
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The program could not be started (missing binary, permissions).
    #[error("failed to run {command}: {source}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The program did not finish within its timeout and was killed.
    #[error("{command} timed out after {}s", timeout.as_secs())]
    TimedOut {
        /// Rendered command line.
        command: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The stdin file could not be opened.
    #[error("failed to open stdin file {path} for {command}: {source}")]
    Stdin {
        /// Rendered command line.
        command: String,
        /// File that was meant to feed stdin.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Waiting for the program failed.
    #[error("failed to wait for {command}: {source}")]
    Wait {
        /// Rendered command line.
        command: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    /// Whether the error came from the timeout elapsing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::TimedOut { .. })
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Spawn { .. } => "command_spawn_failed",
            CommandError::TimedOut { .. } => "command_timed_out",
            CommandError::Stdin { .. } => "command_stdin_failed",
            CommandError::Wait { .. } => "command_wait_failed",
        }
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
    /// Exit status.
    pub status: ExitStatus,
}

impl CommandOutput {
    /// Whether the program exited with status zero.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, if the program was not killed by a signal.
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Trimmed stdout and stderr joined for error messages.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

/// A program invocation with a bounded runtime.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: OsString,
    args: Vec<OsString>,
    timeout: Duration,
    stdin_file: Option<PathBuf>,
    current_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Start building an invocation of `program`.
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            stdin_file: None,
            current_dir: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Override the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Feed the contents of `path` to the program's stdin.
    pub fn stdin_file(mut self, path: impl AsRef<Path>) -> Self {
        self.stdin_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Run the program from `dir`.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Program name.
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Arguments in order.
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Configured timeout.
    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }

    /// Space-joined command line for logs and error messages.
    pub fn display(&self) -> String {
        let mut out = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }

    /// Run to completion, capturing output. The child is killed if the timeout
    /// elapses.
    pub async fn run(&self) -> Result<CommandOutput, CommandError> {
        let rendered = self.display();
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        match &self.stdin_file {
            Some(path) => {
                let file = std::fs::File::open(path).map_err(|source| CommandError::Stdin {
                    command: rendered.clone(),
                    path: path.clone(),
                    source,
                })?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        tracing::debug!(command = %rendered, timeout_secs = self.timeout.as_secs(), "running command");
        let child = cmd.spawn().map_err(|source| CommandError::Spawn {
            command: rendered.clone(),
            source,
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| CommandError::Wait {
                command: rendered.clone(),
                source,
            })?,
            Err(_) => {
                return Err(CommandError::TimedOut {
                    command: rendered,
                    timeout: self.timeout,
                })
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status,
        })
    }
}

/// Quote `value` for a POSIX shell.
pub fn sh_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\"'\"'");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Quote a path for a POSIX shell.
pub fn sh_quote_path(path: &Path) -> String {
    sh_quote(&path.as_os_str().to_string_lossy())
}
