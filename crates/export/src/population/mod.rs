//! Read access to imported beneficiary populations
//!
//! Snapshots, their member rows, and the suppression list are written by an
//! external importer. This module only reads them.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryPopulationRepository;
pub use postgres::PostgresPopulationRepository;
pub use store::{
    ImportStatus, MemberRecord, PopulationRepository, SharingPreference, Snapshot,
    SuppressionEntry, CATEGORY_ATTRIBUTION,
};
