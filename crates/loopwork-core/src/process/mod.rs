//! Tracking and cleanup of agent subprocesses that outlive their worker.
//!
//! [`ProcessRegistry`] persists one record per spawned subprocess so that a
//! crashed engine run can be reconciled on the next startup. [`OrphanDetector`]
//! and [`ProcessCleaner`] use that registry to find and terminate processes
//! whose owning worker is gone.

mod cleaner;
mod orphan;
mod registry;

pub(crate) use cleaner::process_alive;
pub use cleaner::{CleanupOutcome, ProcessCleaner};
pub use orphan::{OrphanDetector, OrphanReason};
pub use registry::{ProcessRecord, ProcessRegistry, ProcessStatus};
