//! Artifact store: raw and staging locations, completion markers, final moves.
//!
//! Every artifact an external tool produces is only trusted once its sidecar
//! completion marker exists. Recovery after a crash keeps marker-complete
//! files and discards everything else, so a half-written rip or encode is
//! never mistaken for a finished one.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Suffix appended to an artifact path to form its completion marker.
const MARKER_SUFFIX: &str = ".done";

/// Errors that can occur in artifact store operations.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Failed to create an artifact directory.
    #[error("Failed to create artifact directory {path}: {source}")]
    CreateDirFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write a completion marker.
    #[error("Failed to write completion marker {path}: {source}")]
    MarkerFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to move an artifact to its final location.
    #[error("Failed to move {src} to {dest}: {source}")]
    MoveFailed {
        src: PathBuf,
        dest: PathBuf,
        source: std::io::Error,
    },

    /// Copied file did not match the source length.
    #[error("Copy of {src} to {dest} is truncated ({copied} of {expected} bytes)")]
    CopyTruncated {
        src: PathBuf,
        dest: PathBuf,
        copied: u64,
        expected: u64,
    },

    /// IO error while scanning or cleaning a job directory.
    #[error("Artifact IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Returns the completion marker path for an artifact.
pub fn marker_path(artifact: &Path) -> PathBuf {
    let mut marker = artifact.as_os_str().to_owned();
    marker.push(MARKER_SUFFIX);
    PathBuf::from(marker)
}

/// Manages per-job artifact directories under the raw and staging roots.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    raw_root: PathBuf,
    staging_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(raw_root: impl Into<PathBuf>, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            raw_root: raw_root.into(),
            staging_root: staging_root.into(),
        }
    }

    /// Directory holding a job's raw extracted titles.
    pub fn raw_dir(&self, job_id: &str) -> PathBuf {
        self.raw_root.join(job_id)
    }

    /// Directory holding a job's encoded outputs before the final move.
    pub fn staging_dir(&self, job_id: &str) -> PathBuf {
        self.staging_root.join(job_id)
    }

    /// Path a raw title lands at, without touching the filesystem.
    pub fn raw_title_path(&self, job_id: &str, title_index: u32) -> PathBuf {
        self.raw_dir(job_id)
            .join(format!("title_{:02}.mkv", title_index))
    }

    /// Path an encoded output lands at for a given raw file, without touching
    /// the filesystem. The raw filename is kept so the mapping survives
    /// restarts.
    pub fn output_path_for(&self, job_id: &str, raw: &Path) -> PathBuf {
        let name = raw
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "output.mkv".into());
        self.staging_dir(job_id).join(name)
    }

    /// Reserve the raw location for one title, creating the job directory.
    pub fn reserve_raw_location(
        &self,
        job_id: &str,
        title_index: u32,
    ) -> Result<PathBuf, ArtifactError> {
        ensure_dir(&self.raw_dir(job_id))?;
        Ok(self.raw_title_path(job_id, title_index))
    }

    /// Reserve the staging location matching a raw title file, creating the
    /// job directory.
    pub fn reserve_output_for(&self, job_id: &str, raw: &Path) -> Result<PathBuf, ArtifactError> {
        ensure_dir(&self.staging_dir(job_id))?;
        Ok(self.output_path_for(job_id, raw))
    }

    /// Mark an artifact as complete. Idempotent: re-marking an already
    /// complete artifact succeeds without change.
    pub fn mark_complete(&self, artifact: &Path) -> Result<(), ArtifactError> {
        let marker = marker_path(artifact);
        if marker.exists() {
            return Ok(());
        }
        fs::write(&marker, b"").map_err(|source| ArtifactError::MarkerFailed {
            path: marker,
            source,
        })
    }

    /// Check whether an artifact carries its completion marker and exists.
    pub fn is_complete(&self, artifact: &Path) -> bool {
        artifact.exists() && marker_path(artifact).exists()
    }

    /// Check whether every path in the slice is marker-complete.
    pub fn all_complete(&self, artifacts: &[PathBuf]) -> bool {
        !artifacts.is_empty() && artifacts.iter().all(|p| self.is_complete(p))
    }

    /// Remove unmarked files from a job directory, keeping marker-complete
    /// artifacts and their markers. Used before re-running an interrupted
    /// stage so the tool starts from a clean slate.
    pub fn discard_incomplete(&self, dir: &Path) -> Result<(), ArtifactError> {
        if !dir.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                // Tool scratch directory from an interrupted extraction.
                fs::remove_dir_all(&path)?;
                continue;
            }

            let name = path.to_string_lossy().into_owned();
            if name.ends_with(MARKER_SUFFIX) {
                // Marker whose artifact vanished is stale.
                let artifact = PathBuf::from(&name[..name.len() - MARKER_SUFFIX.len()]);
                if !artifact.exists() {
                    fs::remove_file(&path)?;
                }
                continue;
            }

            if !marker_path(&path).exists() {
                tracing::debug!(path = %path.display(), "Discarding incomplete artifact");
                fs::remove_file(&path)?;
            }
        }

        Ok(())
    }

    /// Remove a job's raw directory entirely. Used after `Done` when raw
    /// retention is disabled.
    pub fn remove_raw_dir(&self, job_id: &str) -> Result<(), ArtifactError> {
        let dir = self.raw_dir(job_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Remove a job's staging directory. Used once every output has been
    /// filed in the library.
    pub fn remove_staging_dir(&self, job_id: &str) -> Result<(), ArtifactError> {
        let dir = self.staging_dir(job_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Move a finished artifact to its final library location.
    ///
    /// Tries a rename first. If the destination is on another filesystem the
    /// rename fails, so fall back to copy, verify the copied length, then
    /// delete the source. On any failure the source is preserved.
    ///
    /// If the destination already exists and the source is gone, the move
    /// already happened before a crash and this is a no-op.
    pub fn move_to_final(&self, src: &Path, dest: &Path) -> Result<(), ArtifactError> {
        if dest.exists() && !src.exists() {
            return Ok(());
        }

        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }

        if fs::rename(src, dest).is_ok() {
            return Ok(());
        }

        let expected = fs::metadata(src)
            .map_err(|source| ArtifactError::MoveFailed {
                src: src.to_path_buf(),
                dest: dest.to_path_buf(),
                source,
            })?
            .len();

        let copied = fs::copy(src, dest).map_err(|source| ArtifactError::MoveFailed {
            src: src.to_path_buf(),
            dest: dest.to_path_buf(),
            source,
        })?;

        if copied != expected {
            let _ = fs::remove_file(dest);
            return Err(ArtifactError::CopyTruncated {
                src: src.to_path_buf(),
                dest: dest.to_path_buf(),
                copied,
                expected,
            });
        }

        fs::remove_file(src).map_err(|source| ArtifactError::MoveFailed {
            src: src.to_path_buf(),
            dest: dest.to_path_buf(),
            source,
        })?;

        Ok(())
    }
}

fn ensure_dir(dir: &Path) -> Result<(), ArtifactError> {
    fs::create_dir_all(dir).map_err(|source| ArtifactError::CreateDirFailed {
        path: dir.to_path_buf(),
        source,
    })
}
