//! Durable work queue
//!
//! Priority-ordered, at-least-once delivery with single-owner leases:
//! - [`WorkQueue`] trait (`enqueue`, `lease`, `renew`, `ack`, `fail`, `reclaim_expired`)
//! - [`InMemoryWorkQueue`] for testing
//! - [`PostgresWorkQueue`] using `FOR UPDATE SKIP LOCKED`
//!
//! A unit whose worker dies keeps its lease until it expires; the pool's
//! reclaim loop then returns it to the queue.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkQueue;
pub use postgres::PostgresWorkQueue;
pub use store::{FailureOutcome, LeasedUnit, NewUnit, ReclaimedUnit, UnitStatus, WorkQueue};
