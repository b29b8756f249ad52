//! Forward-test run persistence port trait.
//!
//! Deliberately synchronous: persistence is local and is not a scheduler
//! suspension point, unlike broker calls.

use chrono::{DateTime, NaiveDate, Utc};

use crate::domain::error::AlphaloopError;
use crate::domain::run::{ForwardTestRun, NewRun, RunId};

pub trait RunStorePort: Send + Sync {
    /// Persist a new run record and assign its id.
    fn create_run(&self, new_run: NewRun) -> Result<ForwardTestRun, AlphaloopError>;

    fn get_run(&self, id: RunId) -> Result<Option<ForwardTestRun>, AlphaloopError>;

    fn list_runs(&self) -> Result<Vec<ForwardTestRun>, AlphaloopError>;

    fn list_active_runs(&self) -> Result<Vec<ForwardTestRun>, AlphaloopError>;

    /// Compare-and-set advance of the last-execution-date marker.
    ///
    /// Succeeds (returns `true`) only when the stored marker differs from
    /// `date`; a second caller on the same day observes `false`. This is
    /// the sole cross-iteration mutable state, so this one operation being
    /// atomic is what makes the once-per-day guard hold across overlapping
    /// ticks and across processes.
    fn mark_executed(&self, id: RunId, date: NaiveDate) -> Result<bool, AlphaloopError>;

    /// Close a run: set the end timestamp and clear the running flag in a
    /// single atomic update. Records are never deleted.
    fn close_run(&self, id: RunId, ended_at: DateTime<Utc>) -> Result<(), AlphaloopError>;
}
