//! Persistence for export jobs and completion markers
//!
//! This module provides:
//! - [`JobStore`] trait for job rows and sub-unit completion markers
//! - [`InMemoryJobStore`] for testing
//! - [`PostgresJobStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use store::{CompletionMarker, JobStore, StoreError};
