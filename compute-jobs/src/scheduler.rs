//! Scheduler endpoint registry.
//!
//! Endpoints are process-wide configuration: loaded once at startup from a
//! JSON file and never mutated afterwards, so the registry is shared as a
//! plain `Arc` without locking.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::BackendKind;
use crate::{Error, Result};

/// Authentication material for an endpoint.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Bearer token presented to HTTP schedulers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A named, configured connection target for one execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerEndpoint {
    pub name: String,
    pub kind: BackendKind,
    /// Base URL for HTTP schedulers; informational for local execution.
    pub address: String,
    #[serde(default)]
    pub credentials: Credentials,
    /// Ceiling on non-terminal jobs; `None` means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<u32>,
    /// Queue or partition used when the job does not pick one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_queue: Option<String>,
}

impl SchedulerEndpoint {
    pub fn new(name: impl Into<String>, kind: BackendKind, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            address: address.into(),
            credentials: Credentials::default(),
            max_concurrent_jobs: None,
            default_queue: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.credentials.token = Some(token.into());
        self
    }

    pub fn with_max_concurrent_jobs(mut self, limit: u32) -> Self {
        self.max_concurrent_jobs = Some(limit);
        self
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = Some(queue.into());
        self
    }
}

/// Read-only name → endpoint lookup.
#[derive(Debug, Default)]
pub struct SchedulerRegistry {
    endpoints: HashMap<String, Arc<SchedulerEndpoint>>,
}

impl SchedulerRegistry {
    /// Build a registry, rejecting duplicate or empty names.
    pub fn new(endpoints: impl IntoIterator<Item = SchedulerEndpoint>) -> Result<Self> {
        let mut map = HashMap::new();
        for endpoint in endpoints {
            if endpoint.name.trim().is_empty() {
                return Err(Error::config("scheduler endpoint with empty name"));
            }
            if endpoint.kind != BackendKind::LocalProcess {
                url::Url::parse(&endpoint.address).map_err(|e| {
                    Error::config(format!(
                        "scheduler '{}' has invalid address '{}': {}",
                        endpoint.name, endpoint.address, e
                    ))
                })?;
            }
            let name = endpoint.name.clone();
            if map.insert(name.clone(), Arc::new(endpoint)).is_some() {
                return Err(Error::config(format!(
                    "duplicate scheduler endpoint '{}'",
                    name
                )));
            }
        }
        Ok(Self { endpoints: map })
    }

    /// Parse a JSON array of endpoints.
    pub fn from_json(raw: &str) -> Result<Self> {
        let endpoints: Vec<SchedulerEndpoint> = serde_json::from_str(raw)?;
        Self::new(endpoints)
    }

    /// Load the registry from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "cannot read scheduler registry {}: {}",
                path.display(),
                e
            ))
        })?;
        let registry = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            count = registry.len(),
            "Loaded scheduler endpoints"
        );
        Ok(registry)
    }

    /// Resolve an endpoint by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<SchedulerEndpoint>> {
        self.endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownScheduler(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
