//! Cohort Engine
//!
//! Daily treatment/control splitting for many audiences, with durable
//! affinity, an append-only audience log and upload hand-off.
//!
//! # Core Concepts
//!
//! - [`EngineConfig`] / [`AudienceConfig`]: TOML configuration, validated before any store access
//! - [`SplitEngine`]: Per-audience sequential runner, cross-audience parallel pool
//! - [`DayBatch`] / [`DayOutcome`]: One day in, one committed day out
//! - [`AudienceLog`]: Append-only record of committed days
//! - [`AudienceSink`]: Receives each `prod` audience's full TEST set
//! - [`EngineError`] / [`HandoffError`]: Failures before and after the commit
//!
//! # Example
//!
//! ```rust,ignore
//! use cohort_engine::{DayBatch, EngineConfig, JsonlAudienceLog, DirectorySink, SplitEngine};
//! use cohort_store::FileAffinityStore;
//! use std::sync::Arc;
//!
//! let config = EngineConfig::load("cohort.toml").await?;
//! let engine = SplitEngine::new(
//!     Arc::new(FileAffinityStore::open(&config.store_dir).await?),
//!     Arc::new(JsonlAudienceLog::new(&config.log_path)),
//!     Arc::new(DirectorySink::new(&config.publish_dir)),
//!     config.settings(),
//! );
//! let audience = config.audience("lapsed_buyers").unwrap();
//! let outcome = engine.run_day(audience, DayBatch::new(day, candidates)).await?;
//! println!("{} users in TEST", outcome.result.test_user_count());
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod config;
mod engine;
mod error;
mod log;
mod outcome;
mod sink;

pub use config::{AudienceConfig, AudienceMode, ConfigError, EngineConfig, EngineSettings};
pub use engine::{AudienceRun, SplitEngine};
pub use error::{EngineError, HandoffError};
pub use log::{AudienceLog, AudienceLogEntry, JsonlAudienceLog, MemoryAudienceLog};
pub use outcome::{AudienceReport, DayBatch, DayOutcome, HandoffStatus, LogStatus, UploadStatus};
pub use sink::{AudienceSink, DirectorySink, MemorySink, PublishedSet};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
