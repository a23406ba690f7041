use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use common::command::{sh_quote, sh_quote_path, CommandError, CommandOutput, CommandSpec};

use crate::config::SshConfig;
use crate::error::DistributorError;

/// ssh exits with 255 when the connection itself failed.
pub const SSH_TRANSPORT_EXIT_CODE: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshHostKeyChecking {
    /// Accept unknown host keys and add them to known_hosts (TOFU).
    AcceptNew,
    /// Require the host key to already exist in known_hosts.
    Strict,
    /// Disable host key checking (insecure).
    Off,
}

impl SshHostKeyChecking {
    fn strict_host_key_checking_value(self) -> &'static str {
        match self {
            Self::AcceptNew => "accept-new",
            Self::Strict => "yes",
            Self::Off => "no",
        }
    }
}

impl FromStr for SshHostKeyChecking {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "accept-new" | "accept_new" => Ok(Self::AcceptNew),
            "strict" | "yes" => Ok(Self::Strict),
            "off" | "no" => Ok(Self::Off),
            other => Err(format!(
                "unknown host key checking mode '{other}'; expected accept-new, strict or off"
            )),
        }
    }
}

/// Connection settings shared by every node.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub program: String,
    pub batch_mode: bool,
    pub connect_timeout_secs: u16,
    pub host_key_checking: SshHostKeyChecking,
    pub identity_file: Option<PathBuf>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            batch_mode: true,
            connect_timeout_secs: 10,
            host_key_checking: SshHostKeyChecking::Strict,
            identity_file: None,
        }
    }
}

impl From<&SshConfig> for SshOptions {
    fn from(cfg: &SshConfig) -> Self {
        Self {
            program: cfg.program.clone(),
            batch_mode: true,
            connect_timeout_secs: cfg.connect_timeout_secs,
            host_key_checking: cfg.host_key_checking,
            identity_file: cfg.identity_file.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
    pub options: SshOptions,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: Option<String>, port: u16, options: SshOptions) -> Self {
        Self {
            host: host.into(),
            user: user.filter(|u| !u.trim().is_empty()),
            port,
            options,
        }
    }

    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn ssh_base(&self) -> CommandSpec {
        let mut args: Vec<OsString> = vec!["-p".into(), self.port.to_string().into()];
        args.push("-o".into());
        args.push(format!("ConnectTimeout={}", self.options.connect_timeout_secs).into());
        args.push("-o".into());
        args.push("ConnectionAttempts=1".into());
        args.push("-o".into());
        args.push(
            format!(
                "StrictHostKeyChecking={}",
                self.options
                    .host_key_checking
                    .strict_host_key_checking_value()
            )
            .into(),
        );
        if self.options.host_key_checking == SshHostKeyChecking::Off {
            args.push("-o".into());
            args.push("UserKnownHostsFile=/dev/null".into());
        }
        args.push("-o".into());
        args.push(
            format!(
                "BatchMode={}",
                if self.options.batch_mode { "yes" } else { "no" }
            )
            .into(),
        );
        if let Some(key) = &self.options.identity_file {
            args.push("-i".into());
            args.push(key.as_os_str().to_os_string());
            args.push("-o".into());
            args.push("IdentitiesOnly=yes".into());
        }
        CommandSpec::new(&self.options.program).args(args)
    }

    /// Command running `argv` on the node. Each argument is quoted on its own,
    /// so the remote shell sees exactly this argument list.
    pub fn remote_command(&self, argv: &[String]) -> CommandSpec {
        let quoted: Vec<String> = argv.iter().map(|arg| sh_quote(arg)).collect();
        self.ssh_base()
            .arg("--")
            .arg(self.destination())
            .args(quoted)
    }

    pub async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, CommandError> {
        self.remote_command(argv).timeout(timeout).run().await
    }

    /// Stream `local` to `remote` over stdin, creating the parent directory.
    pub async fn upload_file(&self, local: &Path, remote: &Path, timeout: Duration) -> Result<(), DistributorError> {
        let script = render_upload_command(remote)?;
        let output = self
            .ssh_base()
            .arg("--")
            .arg(self.destination())
            .arg("sh")
            .arg("-c")
            .arg(sh_quote(&script))
            .stdin_file(local)
            .timeout(timeout)
            .run()
            .await?;
        if output.success() {
            return Ok(());
        }
        Err(DistributorError::Upload {
            path: local.to_path_buf(),
            destination: format!("{}:{}", self.destination(), remote.display()),
            message: describe_failure(self, &output),
        })
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.destination(), self.port)
    }
}

fn render_upload_command(remote: &Path) -> Result<String, DistributorError> {
    let parent = remote
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| DistributorError::Upload {
            path: remote.to_path_buf(),
            destination: remote.display().to_string(),
            message: "remote path has no parent directory".to_string(),
        })?;
    Ok(format!(
        "umask 077; mkdir -p -- {}; cat > {}",
        sh_quote_path(parent),
        sh_quote_path(remote)
    ))
}

pub fn looks_like_ssh_host_key_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("host key verification failed")
        || lower.contains("remote host identification has changed")
        || lower.contains("offending key")
        || lower.contains("man-in-the-middle")
}

pub fn looks_like_ssh_connection_failure(output: &CommandOutput) -> bool {
    if output.code() != Some(SSH_TRANSPORT_EXIT_CODE) {
        return false;
    }
    let lower = output.stderr.to_ascii_lowercase();
    lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("no route to host")
        || lower.contains("could not resolve hostname")
        || lower.contains("network is unreachable")
        || lower.contains("connection closed")
        || lower.contains("permission denied")
        || looks_like_ssh_host_key_failure(&lower)
}

pub fn render_ssh_host_key_failure_hint(target: &SshTarget) -> String {
    let dest = target.destination();
    let host = target.host.as_str();
    let port = target.port;

    format!(
        "ssh host key verification failed for {dest}.\n\
rolefleet defaults to strict host key checking.\n\
\n\
Fix: verify the host fingerprint out-of-band, then add it to known_hosts:\n\
  ssh-keyscan -H -p {port} {host} >> ~/.ssh/known_hosts\n\
\n\
Override (less secure): set ssh.host_key_checking to accept-new (TOFU) or off."
    )
}

/// Status line plus raw output, with a hint for host key failures.
pub fn describe_failure(target: &SshTarget, output: &CommandOutput) -> String {
    let status = output
        .code()
        .map(|c| format!("exit {c}"))
        .unwrap_or_else(|| "killed by signal".to_string());
    let mut message = format!("{status} on {}", target.destination());
    if looks_like_ssh_host_key_failure(&output.stderr) {
        message.push('\n');
        message.push_str(&render_ssh_host_key_failure_hint(target));
    }
    let raw = output.combined();
    if !raw.is_empty() {
        message.push_str(":\n");
        message.push_str(&raw);
    }
    message
}
