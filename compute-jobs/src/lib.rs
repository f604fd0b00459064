//! compute-jobs library crate.
//!
//! Submits units of work to heterogeneous execution backends (HTCondor-style
//! batch queues, Dask-style task graphs, local processes), persists each job
//! as a durable record and keeps its status reconciled with the backend.

pub mod backends;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod manager;
pub mod reconciler;
pub mod scheduler;
pub mod workspace;

pub use error::{Error, Result};
pub use manager::{JobManager, JobStats, PollOutcome};
pub use reconciler::{StatusReconciler, SweepReport};
