//! Repository layer for database access.

pub mod job;
pub mod memory;

pub use job::{DEFAULT_LIST_LIMIT, JobFilter, JobRepository, SqlxJobRepository};
pub use memory::InMemoryJobRepository;
