//! Worker pool for work-unit execution
//!
//! This module provides:
//! - [`WorkerPool`] - Lease, execute, and acknowledge units concurrently
//! - [`UnitProcessor`] - Execution of a single unit with per-member isolation
//! - [`PollerConfig`] - Unit polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         WorkerPool                            │
//! │  ┌─────────────┐  ┌──────────────────┐  ┌─────────────────┐  │
//! │  │ UnitPoller  │  │ Lease heartbeat  │  │ Lease reclaimer │  │
//! │  │  (backoff)  │  │  (in-flight ids) │  │  (expired → Q)  │  │
//! │  └──────┬──────┘  └──────────────────┘  └─────────────────┘  │
//! │         │                                                     │
//! │         ▼                                                     │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │      UnitProcessor (Semaphore-limited)               │    │
//! │  │  [Unit 1] [Unit 2] ... [Unit N]                      │    │
//! │  └──────────────────────┬───────────────────────────────┘    │
//! │                         ▼                                     │
//! │                ArtifactArbiter (one appender per file)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod poller;
mod pool;
mod processor;

pub use poller::{PollerConfig, UnitPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use processor::{ProcessError, UnitProcessor, UnitReport};
