//! # Bulk Export Pipeline
//!
//! Asynchronous bulk export of clinical records for a population of
//! beneficiaries, backed by PostgreSQL.
//!
//! ## Features
//!
//! - **Population diffing**: Members are classified as new or previously seen
//!   against the snapshot in force at the client's `since` instant
//! - **Bounded work units**: Per-resource-type batch quotas and queue priorities
//! - **Durable queue**: Lease-based, at-least-once delivery with bounded retries
//! - **Failure isolation**: A failed member lands in the error artifact and
//!   never fails its unit
//! - **Count-based completion**: Jobs complete when their markers catch up,
//!   regardless of unit order
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExportService                           │
//! │  (create_job, schedule, poll_status)                        │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                         │
//!          ▼                                         ▼
//! ┌──────────────────────────────┐      ┌──────────────────────┐
//! │ BeneficiaryResolver          │      │ CompletionTracker    │
//! │   → JobSplitter (WorkUnits)  │      │ (markers → status)   │
//! └──────────────────────────────┘      └──────────────────────┘
//!          │                                         ▲
//!          ▼                                         │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkQueue                             │
//! │  (PostgreSQL: export_work_queue, FOR UPDATE SKIP LOCKED)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  (leases units, fetches per member, appends artifacts,      │
//! │   records completion markers)                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use bulk_export::prelude::*;
//!
//! let service = ExportService::new(jobs, queue, population, ExportConfig::from_env());
//!
//! let job_id = service.create_job("A9994", "/api/v1/Patient/$export").await?;
//! let since = Since::parse("2020-02-13T08:00:00.000-05:00")?;
//! service
//!     .schedule(job_id, &ResourceType::ALL, Some(&since), true)
//!     .await?;
//!
//! let report = service.poll_status(job_id).await?;
//! println!("{}", report.message);
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod output;
pub mod persistence;
pub mod population;
pub mod queue;
pub mod reliability;
pub mod resolver;
pub mod service;
pub mod splitter;
pub mod tracker;
pub mod worker;

/// Embedded schema migrations for the PostgreSQL implementations
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Prelude for common imports
pub mod prelude {
    pub use crate::client::{ClientError, ClientRegistry, HttpResourceClient, ResourceClient};
    pub use crate::config::{ExportConfig, ResourceQuota};
    pub use crate::error::ExportError;
    pub use crate::model::{ExportJob, JobStatus, JobStatusReport, ResourceType, Since};
    pub use crate::output::ArtifactArbiter;
    pub use crate::persistence::{
        InMemoryJobStore, JobStore, PostgresJobStore, StoreError,
    };
    pub use crate::population::{
        InMemoryPopulationRepository, PopulationRepository, PostgresPopulationRepository,
    };
    pub use crate::queue::{InMemoryWorkQueue, PostgresWorkQueue, WorkQueue};
    pub use crate::reliability::RetryPolicy;
    pub use crate::service::ExportService;
    pub use crate::tracker::CompletionTracker;
    pub use crate::worker::{UnitProcessor, WorkerPool, WorkerPoolConfig, WorkerPoolError};
}

// Re-export key types at crate root
pub use client::{ClientError, ClientRegistry, HttpResourceClient, ResourceClient};
pub use config::{ExportConfig, ResourceQuota};
pub use error::ExportError;
pub use model::{ExportJob, JobStatus, JobStatusReport, ResourceType, Since};
pub use output::{ArtifactArbiter, OperationOutcome, OutputError};
pub use persistence::{
    CompletionMarker, InMemoryJobStore, JobStore, PostgresJobStore, StoreError,
};
pub use population::{
    InMemoryPopulationRepository, PopulationRepository, PostgresPopulationRepository,
};
pub use queue::{InMemoryWorkQueue, PostgresWorkQueue, WorkQueue};
pub use reliability::RetryPolicy;
pub use resolver::{BeneficiaryResolver, Resolution};
pub use service::ExportService;
pub use splitter::{JobSplitter, WorkUnit};
pub use tracker::CompletionTracker;
pub use worker::{UnitProcessor, WorkerPool, WorkerPoolConfig, WorkerPoolError};
