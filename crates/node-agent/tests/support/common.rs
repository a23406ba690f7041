#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use common::checksum::write_sha256_file;
use common::fleet::STAGED_PACKAGE_FILE;
use flate2::write::GzEncoder;
use flate2::Compression;
use node_agent::config::AppConfig;
use tempfile::TempDir;

pub const COMMIT: &str = "abc1234def";

/// A node rooted in one temporary directory, with a fake `systemctl` that
/// logs its arguments. Units named `up` are active, `hang` never answers,
/// `broken` fails restarts.
pub struct FakeNode {
    pub dir: TempDir,
    pub systemctl: PathBuf,
    pub systemctl_log: PathBuf,
    pub install: PathBuf,
    pub staging: PathBuf,
    pub version_file: PathBuf,
    pub roles_file: PathBuf,
}

pub fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

impl FakeNode {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let systemctl = root.join("fake-systemctl");
        let systemctl_log = root.join("systemctl.log");
        write_script(
            &systemctl,
            &format!(
                r#"#!/bin/sh
echo "$*" >> '{log}'
verb="$1"
for unit; do :; done
case "$verb" in
  is-active)
    case "$unit" in
      up.service) exit 0 ;;
      hang.service) exec sleep 5 ;;
      *) exit 3 ;;
    esac ;;
  *)
    case "$unit" in
      broken.service) echo "Job for $unit failed." >&2; exit 1 ;;
    esac
    exit 0 ;;
esac
"#,
                log = systemctl_log.display()
            ),
        );

        Self {
            systemctl,
            systemctl_log,
            install: root.join("install"),
            staging: root.join("staging"),
            version_file: root.join("state").join("agent-version.json"),
            roles_file: root.join("roles.yml"),
            dir,
        }
    }

    pub fn config(&self) -> AppConfig {
        AppConfig {
            roles_file: self.roles_file.clone(),
            detect_interval_secs: 1,
            service_timeout_secs: 1,
            global_version_file: self.install.join("current").join("version.json"),
            version_file: self.version_file.clone(),
            install_dir: self.install.clone(),
            staging_dir: self.staging.clone(),
            agent_unit: "rolefleet-agent.service".into(),
            systemctl: self.systemctl.display().to_string(),
            command_timeout_secs: 5,
            report_file: None,
            metrics_host: "127.0.0.1".into(),
            metrics_port: 0,
        }
    }

    /// Same settings as [`FakeNode::config`], as a file for the binary.
    pub fn write_config(&self) -> PathBuf {
        let path = self.dir.path().join("agent.yaml");
        let body = format!(
            "roles_file: {roles}\nglobal_version_file: {global}\nversion_file: {version}\ninstall_dir: {install}\nstaging_dir: {staging}\nsystemctl: {systemctl}\nservice_timeout_secs: 1\n",
            roles = self.roles_file.display(),
            global = self.install.join("current").join("version.json").display(),
            version = self.version_file.display(),
            install = self.install.display(),
            staging = self.staging.display(),
            systemctl = self.systemctl.display(),
        );
        fs::write(&path, body).expect("config");
        path
    }

    pub fn systemctl_calls(&self) -> Vec<String> {
        fs::read_to_string(&self.systemctl_log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn staged_package(&self) -> PathBuf {
        self.staging.join(STAGED_PACKAGE_FILE)
    }

    /// Stage a well-formed package for `commit` with its checksum.
    pub fn stage_package(&self, commit: &str) -> PathBuf {
        let package = self.staged_package();
        fs::create_dir_all(&self.staging).expect("staging");
        let mut builder = PackageWriter::create(&package);
        builder.dir("agent");
        builder.file("agent/run.sh", b"#!/bin/sh\necho agent\n");
        builder.file("agent/lib/util.sh", b"X=1\n");
        builder.version(commit);
        builder.finish();
        write_sha256_file(&package).expect("checksum");
        package
    }
}

/// Thin wrapper over `tar::Builder` that can also write entries the
/// builder's path checks would refuse.
pub struct PackageWriter {
    builder: tar::Builder<GzEncoder<fs::File>>,
}

impl PackageWriter {
    pub fn create(path: &Path) -> Self {
        let file = fs::File::create(path).expect("create package");
        Self {
            builder: tar::Builder::new(GzEncoder::new(file, Compression::default())),
        }
    }

    fn header(kind: tar::EntryType, size: u64, mode: u32) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(kind);
        header.set_size(size);
        header.set_mode(mode);
        header.set_mtime(0);
        header
    }

    pub fn dir(&mut self, path: &str) {
        let mut header = Self::header(tar::EntryType::Directory, 0, 0o755);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .expect("dir");
    }

    pub fn file(&mut self, path: &str, body: &[u8]) {
        let mut header = Self::header(tar::EntryType::Regular, body.len() as u64, 0o644);
        self.builder.append_data(&mut header, path, body).expect("file");
    }

    pub fn version(&mut self, commit: &str) {
        let body = format!(r#"{{"commit":"{commit}","built_at":"2026-03-01T12:00:00Z"}}"#);
        self.file("version.json", body.as_bytes());
    }

    /// Regular file whose stored name is written verbatim.
    pub fn raw_file(&mut self, name: &str, body: &[u8]) {
        let mut header = Self::header(tar::EntryType::Regular, body.len() as u64, 0o644);
        {
            let gnu = header.as_gnu_mut().expect("gnu header");
            gnu.name = [0; 100];
            gnu.name[..name.len()].copy_from_slice(name.as_bytes());
        }
        header.set_cksum();
        self.builder.append(&header, body).expect("raw file");
    }

    pub fn symlink(&mut self, path: &str, target: &str) {
        let mut header = Self::header(tar::EntryType::Symlink, 0, 0o777);
        self.builder
            .append_link(&mut header, path, target)
            .expect("symlink");
    }

    pub fn finish(self) {
        self.builder
            .into_inner()
            .expect("tar")
            .finish()
            .expect("gzip");
    }
}
