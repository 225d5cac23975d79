//! Debounced persistence of a remote's cursor ordinal

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use libstrand_core::store::SyncCursorStorage;
use libstrand_core::types::operation::now_utc_ms;
use libstrand_core::types::remote::RemoteCursor;
use libstrand_core::Debouncer;
use tracing::{debug, warn};

/// Coalesces cursor updates; the highest ordinal of a window is written once
pub struct CursorWriter {
    pending: Arc<Mutex<Option<u64>>>,
    debouncer: Debouncer<bool>,
}

impl CursorWriter {
    pub fn new(remote_name: &str, storage: Arc<dyn SyncCursorStorage>, delay: Duration) -> Self {
        let pending: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let remote_name = remote_name.to_string();
        let task_pending = pending.clone();
        let debouncer = Debouncer::new(delay, move || {
            let pending = task_pending.clone();
            let storage = storage.clone();
            let remote_name = remote_name.clone();
            async move { write_pending(&remote_name, &pending, storage.as_ref()).await }
        });
        Self { pending, debouncer }
    }

    pub fn update(&self, ordinal: u64) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            *pending = Some(pending.map_or(ordinal, |current| current.max(ordinal)));
        }
        let _ = self.debouncer.trigger(false);
    }

    /// Write any pending ordinal now; false if the write failed
    pub async fn flush(&self) -> bool {
        self.debouncer.call(true).await.unwrap_or(false)
    }
}

async fn write_pending(
    remote_name: &str,
    pending: &Mutex<Option<u64>>,
    storage: &dyn SyncCursorStorage,
) -> bool {
    let Some(ordinal) = pending.lock().unwrap_or_else(PoisonError::into_inner).take() else {
        return true;
    };
    let cursor = RemoteCursor {
        remote_name: remote_name.to_string(),
        cursor_ordinal: ordinal,
        last_synced_at_utc_ms: Some(now_utc_ms()),
    };
    match storage.upsert(&cursor).await {
        Ok(()) => {
            debug!(remote = %remote_name, ordinal, "Cursor persisted");
            true
        }
        Err(e) => {
            warn!(remote = %remote_name, ordinal, error = %e, "Failed to persist cursor");
            let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
            *pending = Some(pending.map_or(ordinal, |current| current.max(ordinal)));
            false
        }
    }
}
