// ABOUTME: Per-request temporary artifact tracking
// ABOUTME: Every temp path is registered before use and removed on every exit path

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// What an artifact is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactRole {
    Input,
    Palette,
    Output,
}

impl ArtifactRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactRole::Input => "input",
            ArtifactRole::Palette => "palette",
            ArtifactRole::Output => "output",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempArtifact {
    pub path: PathBuf,
    pub role: ArtifactRole,
}

/// Artifacts owned by one request.
///
/// Paths are recorded at registration time, before any file exists, so a
/// half-written upload is removed as reliably as a finished output. Call
/// [`ArtifactSet::release`] at the end of the request; if the set is dropped
/// without it (cancelled request, panic) the remaining files are removed
/// synchronously in `Drop`.
#[derive(Debug)]
pub struct ArtifactSet {
    job_id: String,
    dir: PathBuf,
    artifacts: Vec<TempArtifact>,
}

impl ArtifactSet {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            job_id: new_job_id(),
            dir: dir.into(),
            artifacts: Vec::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Reserve `{dir}/{job_id}_{suffix}` and track it
    pub fn register(&mut self, role: ArtifactRole, suffix: &str) -> PathBuf {
        let path = self.dir.join(format!("{}_{}", self.job_id, suffix));
        debug!(job_id = %self.job_id, role = role.as_str(), path = %path.display(), "Registered artifact");
        self.artifacts.push(TempArtifact {
            path: path.clone(),
            role,
        });
        path
    }

    pub fn artifacts(&self) -> &[TempArtifact] {
        &self.artifacts
    }

    /// First registered path with the given role
    pub fn path_for(&self, role: ArtifactRole) -> Option<&Path> {
        self.artifacts
            .iter()
            .find(|a| a.role == role)
            .map(|a| a.path.as_path())
    }

    /// Delete every registered artifact. Failures are logged, never returned.
    pub async fn release(mut self) {
        for artifact in std::mem::take(&mut self.artifacts) {
            match tokio::fs::remove_file(&artifact.path).await {
                Ok(()) => debug!(job_id = %self.job_id, path = %artifact.path.display(), "Removed artifact"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(
                    job_id = %self.job_id,
                    path = %artifact.path.display(),
                    error = %e,
                    "Failed to remove artifact"
                ),
            }
        }
    }
}

impl Drop for ArtifactSet {
    fn drop(&mut self) {
        for artifact in self.artifacts.drain(..) {
            match std::fs::remove_file(&artifact.path) {
                Ok(()) => debug!(job_id = %self.job_id, path = %artifact.path.display(), "Removed artifact on drop"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(
                    job_id = %self.job_id,
                    path = %artifact.path.display(),
                    error = %e,
                    "Failed to remove artifact on drop"
                ),
            }
        }
    }
}

/// `{unix_millis}_{12 random hex chars}`
fn new_job_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", millis, &random[..12])
}

/// Reduce a client-supplied filename to a safe single path component
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(&['/', '\\'][..]).next().unwrap_or("");
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    match cleaned {
        "" | "." | ".." => "upload".to_string(),
        other => other.to_string(),
    }
}
