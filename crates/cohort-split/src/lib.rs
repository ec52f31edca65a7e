//! Cohort Split
//!
//! Decides, for one audience and day, which candidates are TEST and which are
//! CONTROL, keeping every earlier assignment intact.
//!
//! # Core Concepts
//!
//! - [`RetentionResolver`]: Returning / retained / dropped / unseen partition against stored records
//! - [`StratifiedAllocator`]: Deterministic deficit-driven allocation of unseen users, rarest stratum first
//! - [`assemble`]: Merges everything into the immutable [`DaySplitResult`]
//! - [`build_commit`]: The [`DayCommit`](cohort_store::DayCommit) that persists the day
//! - [`BalanceReport`] / [`RatioDrift`]: Diagnostics reported with the counts
//! - [`DaySplitter`]: The chain above in one call
//!
//! # Example
//!
//! ```rust,ignore
//! use cohort_split::{DaySplitter, SplitParams};
//!
//! let splitter = DaySplitter::new(SplitParams { ttl: 3, ..SplitParams::default() }, features)?;
//! let snapshot = store.read(&audience).await?;
//! let split = splitter.split(&snapshot, day, candidates)?;
//! store.write(&audience, split.commit).await?;
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod allocator;
mod assembler;
mod day;
mod diagnostics;
mod error;
mod resolver;
mod writer;

pub use allocator::{Allocation, AllocationState, StratifiedAllocator};
pub use assembler::{assemble, DaySplitResult};
pub use day::{DaySplit, DaySplitter, SplitParams};
pub use diagnostics::{BalanceReport, FeatureBalance, RatioDrift};
pub use error::SplitError;
pub use resolver::{Resolution, RetentionResolver};
pub use writer::build_commit;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
