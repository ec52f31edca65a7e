//! Cohort Affinity Store
//!
//! Durable per-audience mapping from user to `{group, last_seen_day}`; the
//! only mutable state of the split engine.
//!
//! # Overview
//!
//! - [`AssignmentRecord`] / [`Group`]: One user's durable assignment
//! - [`AffinitySnapshot`]: Whole state of one audience, including cumulative counters
//! - [`DayCommit`]: One day's upserts and deletes, validated before any of it applies
//! - [`AffinityStore`]: Explicit `read` / `write` calls scoped to one audience
//! - [`MemoryAffinityStore`] / [`FileAffinityStore`]: Implementations
//!
//! # Example
//!
//! ```rust,ignore
//! use cohort_store::{AffinityStore, AudienceName, FileAffinityStore};
//!
//! let store = FileAffinityStore::open("/var/lib/cohort").await?;
//! let audience = AudienceName::new("lapsed_buyers")?;
//! let snapshot = store.read(&audience).await?;
//! println!("{} live records", snapshot.records.len());
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod file;
mod memory;
mod record;
mod snapshot;
mod store;

pub use file::FileAffinityStore;
pub use memory::MemoryAffinityStore;
pub use record::{AssignmentRecord, AudienceName, Group, GroupCounts};
pub use snapshot::{AffinitySnapshot, DayCommit};
pub use store::{AffinityStore, CommitAck, StoreError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
