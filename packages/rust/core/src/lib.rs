//! Core sync engine for storysync.
//!
//! Ties discovery, crawling, merging, progress tracking and publishing
//! into one incremental run.

pub mod merge;
pub mod pipeline;
pub mod progress;
pub mod store;

pub use merge::{MergeOutcome, merge};
pub use pipeline::{
    EntityReport, ProgressReporter, PublishStatus, RunBudget, RunOptions, RunSummary,
    SilentProgress, run_sync,
};
pub use progress::ProgressStore;
pub use store::Store;
