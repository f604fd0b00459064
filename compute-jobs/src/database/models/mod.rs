//! Database models for compute-jobs.
//!
//! These models map directly to the database schema and handle
//! serialization/deserialization of JSON fields.

pub mod job;

pub use job::*;
