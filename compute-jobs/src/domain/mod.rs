//! Domain types shared by the manager, the adapters and the persistence layer.

pub mod event;
pub mod job;
pub mod spec;

pub use event::{EventLevel, JobEvent};
pub use job::{ErrorKind, JobError, JobRecord, JobStatus};
pub use spec::{BackendKind, FileTransfer, JobSpecification, ResourceRequirements};
