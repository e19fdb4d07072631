//! # Jobstore
//!
//! Persistent job store for a job-scheduling service.
//!
//! ## Features
//!
//! - Concurrency-safe in-memory index with per-user/per-package lookups
//! - Dirty tracking so unchanged stores never touch the disk
//! - Atomic, crash-safe replacement of the persisted file(s)
//! - Clock-aware reload that keeps deadlines meaningful when the wall clock
//!   is not yet trustworthy after boot
//! - Debounced background flushing

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod flusher;
pub mod job;
pub mod layout;
pub mod logging;
pub mod reader;
pub mod store;
pub mod writer;

pub use clock::{Clock, ClockReading, ManualClock, ScheduleTime, SystemClock};
pub use config::load_config;
pub use error::{JobStoreError, ReconciliationWarning};
pub use flusher::{FlushScheduler, flush_async};
pub use job::{ConstraintSet, JobKey, JobRecord, JobSet, NetworkType};
pub use jobstore_config::{Config, FileLayout, LoggingConfig, StoreConfig};
pub use reader::LoadReport;
pub use store::{FlushOutcome, JobIter, JobStore, LoadOutcome, Maintenance};
