#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use control_plane::distributor::{CodeDistributor, PackageBuilder, SshOptions};
use tempfile::TempDir;

pub const GOOD_HOST: &str = "10.0.0.1";
/// Hosts containing this marker fail like an unreachable ssh peer.
pub const UNREACHABLE_HOST: &str = "unreachable.example";
/// Hosts containing this marker hang until killed.
pub const SLOW_HOST: &str = "slow.example";
pub const COMMIT: &str = "abc1234def";

/// A fake `ssh` that runs the remote command locally, plus a fake agent
/// binary, all rooted in one temporary directory.
pub struct FakeFleet {
    pub dir: TempDir,
    pub ssh: PathBuf,
    pub agent: PathBuf,
    pub ssh_log: PathBuf,
    pub agent_log: PathBuf,
    pub staging: PathBuf,
    pub report: PathBuf,
    pub packages: PathBuf,
    pub agent_source: PathBuf,
}

pub fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

impl FakeFleet {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let ssh = root.join("fake-ssh");
        let agent = root.join("fake-agent");
        let ssh_log = root.join("ssh.log");
        let agent_log = root.join("agent.log");
        let staging = root.join("staging");
        let report = root.join("report.json");
        let packages = root.join("packages");
        let agent_source = root.join("agent-src");

        write_script(
            &ssh,
            &format!(
                r#"#!/bin/sh
while [ "$#" -gt 0 ]; do
  case "$1" in
    --) shift; break ;;
  esac
  shift
done
dest="$1"
shift
echo "$dest $*" >> '{log}'
case "$dest" in
  *{unreachable}*)
    echo "ssh: connect to host $dest port 22: Connection timed out" >&2
    exit 255 ;;
  *{slow}*)
    exec sleep 5 ;;
esac
exec sh -c "$*"
"#,
                log = ssh_log.display(),
                unreachable = UNREACHABLE_HOST,
                slow = SLOW_HOST,
            ),
        );
        write_script(
            &agent,
            &format!(
                r#"#!/bin/sh
echo "$*" >> '{log}'
case "$1" in
  sync) echo "activated staged package" ;;
  detect) cat '{report}' ;;
  *) echo "unknown command $1" >&2; exit 2 ;;
esac
"#,
                log = agent_log.display(),
                report = report.display(),
            ),
        );

        fs::create_dir_all(agent_source.join("bin")).expect("agent source");
        fs::write(agent_source.join("bin").join("run.sh"), "#!/bin/sh\necho run\n")
            .expect("agent file");
        fs::write(agent_source.join("README"), "agent\n").expect("agent file");

        Self {
            dir,
            ssh,
            agent,
            ssh_log,
            agent_log,
            staging,
            report,
            packages,
            agent_source,
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            program: self.ssh.display().to_string(),
            ..SshOptions::default()
        }
    }

    pub fn distributor(&self) -> CodeDistributor {
        CodeDistributor::new(
            PackageBuilder::new(&self.packages, &self.agent_source, self.dir.path()),
            self.ssh_options(),
            self.agent.display().to_string(),
            self.staging.display().to_string(),
        )
        .with_timeouts(Duration::from_secs(10), Duration::from_secs(10))
    }

    pub fn agent_log(&self) -> String {
        fs::read_to_string(&self.agent_log).unwrap_or_default()
    }

    pub fn ssh_log(&self) -> String {
        fs::read_to_string(&self.ssh_log).unwrap_or_default()
    }

    /// Minimal control-plane config pointing at this fleet.
    pub fn write_config(&self, infra_base: &Path, inventory: &Path) -> PathBuf {
        let path = self.dir.path().join("config.yaml");
        fs::write(
            &path,
            format!(
                "infra_base: {infra}\n\
                 inventory_path: {inventory}\n\
                 packages:\n  dir: {packages}\n  agent_source_dir: {source}\n  repo_dir: {repo}\n\
                 ssh:\n  program: {ssh}\n  agent_binary: {agent}\n  staging_dir: {staging}\n  command_timeout_secs: 10\n",
                infra = infra_base.display(),
                inventory = inventory.display(),
                packages = self.packages.display(),
                source = self.agent_source.display(),
                repo = self.dir.path().display(),
                ssh = self.ssh.display(),
                agent = self.agent.display(),
                staging = self.staging.display(),
            ),
        )
        .expect("write config");
        path
    }
}

/// Write `<infra>/<role>/manifest.yml`.
pub fn write_manifest(infra: &Path, role: &str, body: &str) {
    let dir = infra.join(role);
    fs::create_dir_all(&dir).expect("role dir");
    fs::write(dir.join("manifest.yml"), body).expect("manifest");
}
