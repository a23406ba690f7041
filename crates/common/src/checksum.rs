use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::Digest;

/// Errors raised while hashing or verifying a package.
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    /// Reading or writing a file failed.
    #[error("checksum io error for {path}: {source}")]
    Io {
        /// File being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The `.sha256` file did not contain a hash.
    #[error("invalid sha256 file: {0}")]
    InvalidFile(PathBuf),
    /// The computed hash did not match the expected one.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Mismatch {
        /// File that was hashed.
        path: PathBuf,
        /// Hash read from the checksum file.
        expected: String,
        /// Hash computed from the file contents.
        actual: String,
    },
}

impl ChecksumError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ChecksumError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Path of the checksum file that sits next to `path` (`<path>.sha256`).
pub fn sha256_path_for(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(".sha256");
    PathBuf::from(raw)
}

/// Lowercase hex SHA-256 of the file at `path`.
pub fn sha256_hex(path: &Path) -> Result<String, ChecksumError> {
    let mut file = fs::File::open(path).map_err(|err| ChecksumError::io(path, err))?;
    let mut hasher = sha2::Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|err| ChecksumError::io(path, err))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Read the first whitespace-separated token of a `sha256sum`-style file.
pub fn parse_sha256_file(path: &Path) -> Result<String, ChecksumError> {
    let raw = fs::read_to_string(path).map_err(|err| ChecksumError::io(path, err))?;
    raw.split_whitespace()
        .next()
        .map(|hash| hash.to_ascii_lowercase())
        .ok_or_else(|| ChecksumError::InvalidFile(path.to_path_buf()))
}

/// Hash `path` and write `<hash>  <file name>` to `<path>.sha256`.
///
/// Returns the hash.
pub fn write_sha256_file(path: &Path) -> Result<String, ChecksumError> {
    let hash = sha256_hex(path)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sha_path = sha256_path_for(path);
    fs::write(&sha_path, format!("{hash}  {file_name}\n"))
        .map_err(|err| ChecksumError::io(&sha_path, err))?;
    Ok(hash)
}

/// Verify `path` against the hash stored in `sha_file`.
pub fn verify_sha256(path: &Path, sha_file: &Path) -> Result<(), ChecksumError> {
    let expected = parse_sha256_file(sha_file)?;
    let actual = sha256_hex(path)?;
    if expected != actual {
        return Err(ChecksumError::Mismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sha256_file_reads_first_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.tar.gz.sha256");
        fs::write(&path, "ABC123  agent.tar.gz\n").expect("write");

        let parsed = parse_sha256_file(&path).expect("parse");
        assert_eq!(parsed, "abc123");
    }

    #[test]
    fn parse_sha256_file_rejects_empty_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.sha256");
        fs::write(&path, "  \n").expect("write");

        let err = parse_sha256_file(&path).expect_err("should fail");
        assert!(matches!(err, ChecksumError::InvalidFile(_)));
    }

    #[test]
    fn write_then_verify_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("agent-abc.tar.gz");
        fs::write(&archive, b"hello").expect("write archive");

        let hash = write_sha256_file(&archive).expect("write sha");
        // sha256("hello")
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let sha_path = sha256_path_for(&archive);
        assert_eq!(
            fs::read_to_string(&sha_path).expect("read"),
            format!("{hash}  agent-abc.tar.gz\n")
        );
        verify_sha256(&archive, &sha_path).expect("verify");
    }

    #[test]
    fn verify_sha256_reports_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("agent.tar.gz");
        fs::write(&archive, b"hello").expect("write archive");
        let sha_file = dir.path().join("agent.tar.gz.sha256");
        fs::write(&sha_file, "deadbeef  agent.tar.gz\n").expect("write sha");

        let err = verify_sha256(&archive, &sha_file).expect_err("should fail");
        match err {
            ChecksumError::Mismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, "deadbeef");
                assert_ne!(actual, expected);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn sha256_hex_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = sha256_hex(&dir.path().join("missing")).expect_err("should fail");
        assert!(matches!(err, ChecksumError::Io { .. }));
    }
}
