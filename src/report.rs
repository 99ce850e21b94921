//! Report lifecycle: dedup, detached clustering runs and terminal status.

mod manager;
mod tracker;

pub use manager::{INTERRUPTED_REASON, ReportManager, RequestOutcome};
