//! Per-application job workspaces.
//!
//! The core never builds workspace paths itself: it asks a [`Workspace`] for
//! a [`WorkspaceDir`] handle and only reads and writes through it.

use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::{Error, Result};

/// Resolves the directory a job stages its files in.
pub trait Workspace: Send + Sync {
    fn resolve(&self, application_id: &str, job_id: Uuid) -> Result<WorkspaceDir>;
}

/// Opaque handle to a job's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceDir {
    root: PathBuf,
}

impl WorkspaceDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path of a file inside the directory. Absolute paths and `..`
    /// components are rejected.
    pub fn file(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.as_os_str().is_empty() {
            return Err(Error::validation(format!(
                "path '{}' is not inside the job workspace",
                relative.display()
            )));
        }
        Ok(self.root.join(relative))
    }

    /// Create the directory if it does not exist.
    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

/// Workspaces laid out as `<root>/<application_id>/<job_id>` on a local or
/// shared filesystem.
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Workspace for LocalWorkspace {
    fn resolve(&self, application_id: &str, job_id: Uuid) -> Result<WorkspaceDir> {
        let valid = !application_id.is_empty()
            && application_id != "."
            && application_id != ".."
            && application_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(Error::validation(format!(
                "application id '{}' cannot name a workspace",
                application_id
            )));
        }
        Ok(WorkspaceDir::new(
            self.root.join(application_id).join(job_id.to_string()),
        ))
    }
}
