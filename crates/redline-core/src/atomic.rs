//! Crash-safe artifact persistence with integrity markers.
//!
//! [`AtomicWriter::write`] stages content in `<path>.tmp`, fsyncs it, renames
//! it over `<path>` and fsyncs the directory, then does the same for a
//! `<path>.ok` marker holding `{sha256, size, timestamp}`. A crash before the
//! rename leaves the previous file (or nothing) at `<path>`; a crash after it
//! leaves a stale or missing marker, which [`AtomicWriter::verify`] reports
//! as corruption. Nothing is ever repaired automatically.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const TMP_SUFFIX: &str = ".tmp";
const MARKER_SUFFIX: &str = ".ok";

#[derive(Debug, thiserror::Error)]
pub enum AtomicWriteError {
    #[error("atomic write I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("integrity marker for {path} is unreadable: {reason}")]
    BadMarker { path: PathBuf, reason: String },

    #[error("corruption detected in {path}: {reason}")]
    CorruptionDetected { path: PathBuf, reason: String },
}

impl AtomicWriteError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type AtomicResult<T> = std::result::Result<T, AtomicWriteError>;

/// Contents of a `<path>.ok` sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityMarker {
    pub sha256: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

impl IntegrityMarker {
    fn for_bytes(bytes: &[u8]) -> Self {
        Self {
            sha256: sha256_hex(bytes),
            size: bytes.len() as u64,
            timestamp: Utc::now(),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a file's current on-disk bytes.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    Ok(sha256_hex(&fs::read(path)?))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn marker_path(path: &Path) -> PathBuf {
    with_suffix(path, MARKER_SUFFIX)
}

pub fn tmp_path(path: &Path) -> PathBuf {
    with_suffix(path, TMP_SUFFIX)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicWriter;

impl AtomicWriter {
    /// Atomically replace `path` with `content` and write its marker.
    pub fn write(path: &Path, content: &[u8]) -> AtomicResult<IntegrityMarker> {
        replace_file(path, content)?;
        Self::write_marker(path, IntegrityMarker::for_bytes(content))
    }

    /// Serialize `value` as pretty JSON and write it atomically.
    pub fn write_json<T: Serialize>(path: &Path, value: &T) -> AtomicResult<IntegrityMarker> {
        let mut bytes =
            serde_json::to_vec_pretty(value).map_err(|e| AtomicWriteError::io(path, e.into()))?;
        bytes.push(b'\n');
        Self::write(path, &bytes)
    }

    /// Write a marker for a file that was produced elsewhere (e.g. an
    /// append-only log that is now complete).
    pub fn seal(path: &Path) -> AtomicResult<IntegrityMarker> {
        let bytes = fs::read(path).map_err(|e| AtomicWriteError::io(path, e))?;
        Self::write_marker(path, IntegrityMarker::for_bytes(&bytes))
    }

    /// Recompute `path`'s hash and size and compare them with its marker.
    pub fn verify(path: &Path) -> AtomicResult<IntegrityMarker> {
        let marker_file = marker_path(path);
        let raw = match fs::read(&marker_file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AtomicWriteError::CorruptionDetected {
                    path: path.to_path_buf(),
                    reason: "integrity marker missing".to_string(),
                })
            }
            Err(e) => return Err(AtomicWriteError::io(&marker_file, e)),
        };
        let marker: IntegrityMarker =
            serde_json::from_slice(&raw).map_err(|e| AtomicWriteError::BadMarker {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AtomicWriteError::CorruptionDetected {
                    path: path.to_path_buf(),
                    reason: "file missing but marker present".to_string(),
                })
            }
            Err(e) => return Err(AtomicWriteError::io(path, e)),
        };
        if bytes.len() as u64 != marker.size {
            return Err(AtomicWriteError::CorruptionDetected {
                path: path.to_path_buf(),
                reason: format!("size {} != recorded {}", bytes.len(), marker.size),
            });
        }
        let actual = sha256_hex(&bytes);
        if actual != marker.sha256 {
            return Err(AtomicWriteError::CorruptionDetected {
                path: path.to_path_buf(),
                reason: format!("sha256 {actual} != recorded {}", marker.sha256),
            });
        }
        Ok(marker)
    }

    fn write_marker(path: &Path, marker: IntegrityMarker) -> AtomicResult<IntegrityMarker> {
        let marker_file = marker_path(path);
        let bytes = serde_json::to_vec(&marker)
            .map_err(|e| AtomicWriteError::io(&marker_file, e.into()))?;
        replace_file(&marker_file, &bytes)?;
        Ok(marker)
    }
}

fn replace_file(path: &Path, content: &[u8]) -> AtomicResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| AtomicWriteError::io(parent, e))?;

    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp).map_err(|e| AtomicWriteError::io(&tmp, e))?;
        file.write_all(content)
            .map_err(|e| AtomicWriteError::io(&tmp, e))?;
        file.sync_all().map_err(|e| AtomicWriteError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| AtomicWriteError::io(path, e))?;
    sync_dir(parent)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> AtomicResult<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| AtomicWriteError::io(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> AtomicResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("summary.json");
        let marker = AtomicWriter::write(&path, b"{\"ok\":true}").unwrap();
        assert_eq!(marker.size, 11);
        assert_eq!(fs::read(&path).unwrap(), b"{\"ok\":true}");
        assert!(marker_path(&path).exists());
        assert!(!tmp_path(&path).exists());
        assert_eq!(AtomicWriter::verify(&path).unwrap().sha256, marker.sha256);
    }

    #[test]
    fn tampered_content_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proof.json");
        AtomicWriter::write(&path, b"original").unwrap();
        fs::write(&path, b"0riginal").unwrap();
        match AtomicWriter::verify(&path) {
            Err(AtomicWriteError::CorruptionDetected { reason, .. }) => {
                assert!(reason.contains("sha256"))
            }
            other => panic!("expected corruption, got {other:?}"),
        }
        fs::write(&path, b"short").unwrap();
        assert!(matches!(
            AtomicWriter::verify(&path),
            Err(AtomicWriteError::CorruptionDetected { .. })
        ));
    }

    #[test]
    fn missing_marker_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.json");
        fs::write(&path, b"{}").unwrap();
        assert!(matches!(
            AtomicWriter::verify(&path),
            Err(AtomicWriteError::CorruptionDetected { .. })
        ));
    }

    #[test]
    fn interrupted_write_leaves_previous_version_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        AtomicWriter::write(&path, b"v1").unwrap();

        // Simulate a crash after the temp file was written but before rename.
        fs::write(tmp_path(&path), b"v2-partial").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"v1");
        AtomicWriter::verify(&path).unwrap();

        // The next write replaces the stale temp file.
        AtomicWriter::write(&path, b"v2").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"v2");
        assert!(!tmp_path(&path).exists());
        AtomicWriter::verify(&path).unwrap();
    }

    #[test]
    fn interrupted_first_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.json");
        fs::write(tmp_path(&path), b"partial").unwrap();
        assert!(!path.exists());
        assert!(AtomicWriter::verify(&path).is_err());
    }

    #[test]
    fn seal_marks_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_tape.jsonl");
        fs::write(&path, b"{\"seq\":0}\n").unwrap();
        AtomicWriter::seal(&path).unwrap();
        AtomicWriter::verify(&path).unwrap();

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"seq\":1}\n").unwrap();
        assert!(AtomicWriter::verify(&path).is_err());
    }

    #[test]
    fn write_json_is_pretty_and_verifiable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        AtomicWriter::write_json(&path, &serde_json::json!({"a": 1})).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  \"a\": 1"));
        AtomicWriter::verify(&path).unwrap();
    }
}
