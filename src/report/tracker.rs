use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::AbortHandle;

use crate::store::models::ReportId;

/// Handles of clustering runs still in flight, keyed by report.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunTracker {
    runs: Arc<Mutex<HashMap<ReportId, AbortHandle>>>,
}

impl RunTracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<ReportId, AbortHandle>> {
        // The map stays consistent even if a holder panicked.
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, id: ReportId, handle: AbortHandle) {
        self.lock().insert(id, handle);
    }

    /// Forgets a run that ended on its own.
    pub(crate) fn finish(&self, id: ReportId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Aborts the run for `id` if one is in flight.
    pub(crate) fn cancel(&self, id: ReportId) -> bool {
        match self.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_running(&self, id: ReportId) -> bool {
        self.lock().contains_key(&id)
    }

    pub(crate) fn active(&self) -> usize {
        self.lock().len()
    }
}
