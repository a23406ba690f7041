//! Host inspection: listening ports and service state.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use common::command::{CommandError, CommandSpec};
use tracing::debug;

const SS_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_LISTEN_STATE: &str = "0A";
const UNIT_SUFFIXES: &[&str] = &[
    "service",
    "socket",
    "target",
    "timer",
    "mount",
    "automount",
    "path",
    "slice",
    "scope",
    "swap",
    "device",
];

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("`{command}` failed: {output}")]
    CommandFailed { command: String, output: String },
}

#[async_trait]
pub trait HostInspector: Send + Sync {
    /// All TCP ports in LISTEN state on the host.
    async fn listening_ports(&self) -> Result<BTreeSet<u16>, HostError>;

    /// Whether `unit` is active according to the service manager.
    async fn service_active(&self, unit: &str, timeout: Duration) -> Result<bool, HostError>;
}

/// Append `.service` to unit names without a known unit suffix.
pub fn normalize_unit(name: &str) -> String {
    let name = name.trim();
    let has_suffix = name
        .rsplit_once('.')
        .is_some_and(|(_, suffix)| UNIT_SUFFIXES.contains(&suffix));
    if has_suffix {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}

/// Ports in LISTEN state from the contents of `/proc/net/tcp{,6}`.
pub fn parse_proc_net_tcp(contents: &str) -> BTreeSet<u16> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let local = fields.nth(1)?;
            let state = fields.nth(1)?;
            if state != TCP_LISTEN_STATE {
                return None;
            }
            let (_, port) = local.rsplit_once(':')?;
            u16::from_str_radix(port, 16).ok()
        })
        .collect()
}

/// Ports from `ss -H -ltn` output (`State Recv-Q Send-Q Local Peer`).
pub fn parse_ss_output(output: &str) -> BTreeSet<u16> {
    output
        .lines()
        .filter_map(|line| {
            let local = line.split_whitespace().nth(3)?;
            let (_, port) = local.rsplit_once(':')?;
            port.parse().ok()
        })
        .collect()
}

/// Inspects the local machine through procfs, `ss` and `systemctl`.
#[derive(Debug, Clone)]
pub struct SystemHost {
    systemctl: String,
    ss: String,
    proc_net: Vec<PathBuf>,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new("systemctl")
    }
}

impl SystemHost {
    pub fn new(systemctl: impl Into<String>) -> Self {
        Self {
            systemctl: systemctl.into(),
            ss: "ss".to_string(),
            proc_net: vec![
                PathBuf::from("/proc/net/tcp"),
                PathBuf::from("/proc/net/tcp6"),
            ],
        }
    }

    pub fn with_ss(mut self, ss: impl Into<String>) -> Self {
        self.ss = ss.into();
        self
    }

    pub fn with_proc_net(mut self, paths: Vec<PathBuf>) -> Self {
        self.proc_net = paths;
        self
    }

    async fn procfs_ports(&self) -> Result<BTreeSet<u16>, HostError> {
        let mut ports = BTreeSet::new();
        let mut read_any = false;
        let mut last_err = None;
        for path in &self.proc_net {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => {
                    read_any = true;
                    ports.extend(parse_proc_net_tcp(&contents));
                }
                Err(source) => {
                    last_err = Some(HostError::Io {
                        path: path.clone(),
                        source,
                    })
                }
            }
        }
        match (read_any, last_err) {
            (false, Some(err)) => Err(err),
            _ => Ok(ports),
        }
    }

    async fn ss_ports(&self) -> Result<BTreeSet<u16>, HostError> {
        let spec = CommandSpec::new(&self.ss)
            .args(["-H", "-ltn"])
            .timeout(SS_TIMEOUT);
        let output = spec.run().await?;
        if !output.success() {
            return Err(HostError::CommandFailed {
                command: spec.display(),
                output: output.combined(),
            });
        }
        Ok(parse_ss_output(&output.stdout))
    }
}

#[async_trait]
impl HostInspector for SystemHost {
    async fn listening_ports(&self) -> Result<BTreeSet<u16>, HostError> {
        match self.procfs_ports().await {
            Ok(ports) => Ok(ports),
            Err(err) => {
                debug!(error = %err, "procfs unavailable, falling back to ss");
                self.ss_ports().await
            }
        }
    }

    async fn service_active(&self, unit: &str, timeout: Duration) -> Result<bool, HostError> {
        let unit = normalize_unit(unit);
        let output = CommandSpec::new(&self.systemctl)
            .args(["is-active", "--quiet", "--", unit.as_str()])
            .timeout(timeout)
            .run()
            .await?;
        Ok(output.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_NET_TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 23456 1 0000000000000000 100 0 0 10 0
   2: 0100007F:D2F0 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 34567 1 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn parses_listening_sockets_only() {
        let ports = parse_proc_net_tcp(PROC_NET_TCP);
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![22, 8080]);
    }

    #[test]
    fn parses_ipv6_entries() {
        let contents = "header\n   0: 00000000000000000000000000000000:01BB 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1 1\n";
        assert_eq!(parse_proc_net_tcp(contents).into_iter().collect::<Vec<_>>(), vec![443]);
    }

    #[test]
    fn parses_ss_output() {
        let output = "LISTEN 0      4096   127.0.0.53%lo:53        0.0.0.0:*\n\
                      LISTEN 0      128          0.0.0.0:22        0.0.0.0:*\n\
                      LISTEN 0      511             [::]:80           [::]:*\n";
        assert_eq!(
            parse_ss_output(output).into_iter().collect::<Vec<_>>(),
            vec![22, 53, 80]
        );
    }

    #[test]
    fn unit_names_get_service_suffix() {
        assert_eq!(normalize_unit("nginx"), "nginx.service");
        assert_eq!(normalize_unit("nginx.service"), "nginx.service");
        assert_eq!(normalize_unit("docker.socket"), "docker.socket");
        assert_eq!(normalize_unit("app.v2"), "app.v2.service");
    }

    #[tokio::test]
    async fn falls_back_to_ss_when_procfs_is_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ss = dir.path().join("ss");
        std::fs::write(
            &ss,
            "#!/bin/sh\necho 'LISTEN 0 128 0.0.0.0:6379 0.0.0.0:*'\n",
        )
        .expect("write");
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&ss, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let host = SystemHost::new("systemctl")
            .with_ss(ss.display().to_string())
            .with_proc_net(vec![dir.path().join("no-such-tcp")]);
        let ports = host.listening_ports().await.expect("ports");
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![6379]);
    }
}
