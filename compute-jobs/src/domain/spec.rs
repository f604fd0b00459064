//! Job specification: what to run and where.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Execution technology a job is dispatched to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendKind {
    /// External batch/grid scheduler with queue semantics (HTCondor style).
    BatchQueue,
    /// Distributed task-graph executor.
    TaskGraph,
    /// Child process on the local host.
    LocalProcess,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BatchQueue => "BATCH_QUEUE",
            Self::TaskGraph => "TASK_GRAPH",
            Self::LocalProcess => "LOCAL_PROCESS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BATCH_QUEUE" => Some(Self::BatchQueue),
            "TASK_GRAPH" => Some(Self::TaskGraph),
            "LOCAL_PROCESS" => Some(Self::LocalProcess),
            _ => None,
        }
    }
}

/// Resources a job asks the backend for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// Number of CPU cores.
    pub cpus: u32,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Number of GPUs, if any are needed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mb: 1024,
            gpus: None,
        }
    }
}

/// A file moved between the job's working directory and remote storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    /// Path relative to the job's working directory.
    pub local: String,
    /// Location in remote storage.
    pub remote: String,
}

impl FileTransfer {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

/// Immutable description of a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpecification {
    pub backend: BackendKind,
    /// Executable or command name.
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Explicit working directory. When absent the workspace collaborator
    /// supplies one per job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Name of the scheduler endpoint the job runs on.
    pub scheduler: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_files: Vec<FileTransfer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_files: Vec<FileTransfer>,
}

impl JobSpecification {
    pub fn new(
        backend: BackendKind,
        command: impl Into<String>,
        scheduler: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            command: command.into(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            working_directory: None,
            resources: ResourceRequirements::default(),
            scheduler: scheduler.into(),
            input_files: Vec::new(),
            output_files: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_input(mut self, transfer: FileTransfer) -> Self {
        self.input_files.push(transfer);
        self
    }

    pub fn with_output(mut self, transfer: FileTransfer) -> Self {
        self.output_files.push(transfer);
        self
    }

    /// Structural checks that need no external lookups.
    ///
    /// Scheduler resolution and adapter availability are checked by the
    /// manager, which owns those registries.
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::validation("command must not be empty"));
        }
        if self.scheduler.trim().is_empty() {
            return Err(Error::validation("scheduler reference must not be empty"));
        }
        for key in self.environment.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(Error::validation(format!(
                    "invalid environment variable name '{key}'"
                )));
            }
        }
        if self.arguments.iter().any(|a| a.contains('\0')) {
            return Err(Error::validation("arguments must not contain NUL bytes"));
        }
        for transfer in self.input_files.iter().chain(&self.output_files) {
            if transfer.local.trim().is_empty() || transfer.remote.trim().is_empty() {
                return Err(Error::validation(
                    "file transfers need both a local and a remote path",
                ));
            }
            if std::path::Path::new(&transfer.local).is_absolute()
                || transfer.local.split(['/', '\\']).any(|c| c == "..")
            {
                return Err(Error::validation(format!(
                    "local transfer path '{}' must stay inside the working directory",
                    transfer.local
                )));
            }
        }
        if self.resources.gpus == Some(0) {
            return Err(Error::validation("gpus must be omitted or at least 1"));
        }
        Ok(())
    }
}
