//! Listener update loop
//!
//! Compares sync-unit revisions with what each listener acknowledged,
//! sends the missing operations through the listener's push transmitter
//! and records the acknowledgements. Triggers are debounced; a pass that
//! learns the remote is behind runs again, up to `max_continues` times.

use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use libstrand_core::config::ListenerConfig;
use libstrand_core::store::ListenerStorage;
use libstrand_core::types::listener::{ListenerRevision, ListenerStatus, UpdateStatus};
use libstrand_core::types::operation::now_utc_ms;
use libstrand_core::types::sync_unit::SyncUnitQuery;
use libstrand_core::{
    Debouncer, Listener, ListenerRegistry, ListenerState, StrandError, StrandUpdate, SyncUnit,
    SyncUnitRegistry,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::ListenerError;
use crate::strands::{GetStrandsOptions, StrandCollector};
use crate::sync_status::{SyncDirection, SyncStatus, SyncStatusTracker};
use crate::transmitter::{PushTransmitter, Transmitter, TransmitterManager, UpdateSource};

/// Called with the error, the drive id and the listener's state
pub type ErrorCallback = Arc<dyn Fn(&ListenerError, &str, &ListenerState) + Send + Sync>;

/// Called with the outdated listeners before an update is triggered
pub type WillUpdateCallback = Box<dyn FnOnce(&[Listener]) + Send>;

/// Marker carried by remote errors that ask for the operations again
const MISSING_OPERATIONS: &str = "Missing operations";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerManagerOptions {
    pub update_delay: Duration,
    pub sequential_updates: bool,
    pub max_continues: u32,
}

impl Default for ListenerManagerOptions {
    fn default() -> Self {
        ListenerConfig::default().into()
    }
}

impl From<ListenerConfig> for ListenerManagerOptions {
    fn from(config: ListenerConfig) -> Self {
        Self {
            update_delay: config.update_delay(),
            sequential_updates: config.sequential_updates,
            max_continues: config.max_continues,
        }
    }
}

/// Acknowledgements a listener returned in one pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerUpdate {
    pub listener_id: String,
    pub listener_revisions: Vec<ListenerRevision>,
}

type UpdateResult = Result<Vec<ListenerUpdate>, ListenerError>;

#[derive(Default)]
struct PendingTrigger {
    source: UpdateSource,
    on_error: Vec<ErrorCallback>,
}

#[derive(Default)]
struct ListenerOutcome {
    update: Option<ListenerUpdate>,
    continuation_needed: bool,
}

struct UpdateLoop {
    options: ListenerManagerOptions,
    listeners: Arc<ListenerRegistry>,
    sync_units: Arc<SyncUnitRegistry>,
    transmitters: Arc<TransmitterManager>,
    strands: Arc<StrandCollector>,
    status: Arc<SyncStatusTracker>,
    pending: Mutex<PendingTrigger>,
    /// Serializes update passes
    running: tokio::sync::Mutex<()>,
}

impl UpdateLoop {
    async fn run(&self) -> UpdateResult {
        let PendingTrigger { source, on_error } = mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let _running = self.running.lock().await;

        let mut updates = Vec::new();
        let mut continues = 0;
        loop {
            let (pass, continuation_needed) = self.update_pass(&source, &on_error).await;
            updates.extend(pass);
            if !continuation_needed {
                return Ok(updates);
            }
            if continues >= self.options.max_continues {
                error!(max_continues = self.options.max_continues, "Listener update did not converge");
                return Err(ListenerError::RetriesExhausted(self.options.max_continues));
            }
            continues += 1;
            debug!(continues, "Continuing listener update");
        }
    }

    async fn update_pass(
        &self,
        source: &UpdateSource,
        on_error: &[ErrorCallback],
    ) -> (Vec<ListenerUpdate>, bool) {
        let mut targets = Vec::new();
        for drive_id in self.listeners.drives() {
            for state in self.listeners.listeners_for_drive(&drive_id) {
                // pull listeners are served on request
                if let Some(Transmitter::Push(push)) = self
                    .transmitters
                    .get_transmitter(&state.listener.listener_id)
                    .await
                {
                    targets.push((drive_id.clone(), state, push));
                }
            }
        }

        let outcomes = if self.options.sequential_updates {
            let mut outcomes = Vec::with_capacity(targets.len());
            for (drive_id, state, push) in targets {
                outcomes.push(self.update_listener(&drive_id, state, push, source, on_error).await);
            }
            outcomes
        } else {
            join_all(targets.into_iter().map(|(drive_id, state, push)| async move {
                self.update_listener(&drive_id, state, push, source, on_error)
                    .await
            }))
            .await
        };

        let continuation_needed = outcomes.iter().any(|o| o.continuation_needed);
        let updates = outcomes.into_iter().filter_map(|o| o.update).collect();
        (updates, continuation_needed)
    }

    async fn update_listener(
        &self,
        drive_id: &str,
        state: ListenerState,
        push: Arc<dyn PushTransmitter>,
        source: &UpdateSource,
        on_error: &[ErrorCallback],
    ) -> ListenerOutcome {
        let listener_id = state.listener.listener_id.clone();
        let strands = match self.outdated_strands(drive_id, &state).await {
            Ok(strands) => strands,
            Err(e) => {
                self.fail(drive_id, &listener_id, &state, e, on_error);
                return ListenerOutcome::default();
            }
        };
        if strands.is_empty() {
            return ListenerOutcome::default();
        }

        if let Err(e) = self
            .listeners
            .set_listener_status(&listener_id, ListenerStatus::Pending, None)
        {
            debug!(listener = %listener_id, error = %e, "Failed to mark listener pending");
        }
        self.status
            .update_status(drive_id, SyncDirection::Push, SyncStatus::Syncing, None);
        debug!(drive = %drive_id, listener = %listener_id, strands = strands.len(), "Transmitting strands");

        let result = match push.transmit(&strands, source).await {
            Ok(revisions) => self
                .apply_acknowledgements(&listener_id, &strands, &revisions)
                .map(|continuation| (revisions, continuation)),
            Err(e) => Err(e),
        };

        match result {
            Ok((revisions, continuation_needed)) => {
                if let Err(e) = self
                    .listeners
                    .set_listener_status(&listener_id, ListenerStatus::Success, None)
                {
                    debug!(listener = %listener_id, error = %e, "Failed to mark listener successful");
                }
                self.status
                    .update_status(drive_id, SyncDirection::Push, SyncStatus::Success, None);
                ListenerOutcome {
                    update: Some(ListenerUpdate {
                        listener_id,
                        listener_revisions: revisions,
                    }),
                    continuation_needed,
                }
            }
            Err(e) => {
                self.fail(drive_id, &listener_id, &state, e, on_error);
                ListenerOutcome::default()
            }
        }
    }

    /// One strand per sync unit the listener lags behind on
    async fn outdated_strands(
        &self,
        drive_id: &str,
        state: &ListenerState,
    ) -> Result<Vec<StrandUpdate>, ListenerError> {
        let units: Vec<SyncUnit> = self
            .sync_units
            .filter_sync_units(&SyncUnitQuery::for_drive(drive_id, state.listener.filter.clone()))
            .into_iter()
            .filter(|unit| state.listener_rev(&unit.id) < unit.revision)
            .collect();

        let fetched = if self.options.sequential_updates {
            let mut fetched = Vec::with_capacity(units.len());
            for unit in &units {
                fetched.push(
                    self.strands
                        .fetch_strand(unit, state.listener_rev(&unit.id), None, None)
                        .await,
                );
            }
            fetched
        } else {
            join_all(units.iter().map(|unit| {
                self.strands
                    .fetch_strand(unit, state.listener_rev(&unit.id), None, None)
            }))
            .await
        };

        let mut strands = Vec::new();
        for strand in fetched {
            strands.extend(strand?);
        }
        Ok(strands)
    }

    /// Record acknowledgements; returns whether another pass is needed
    fn apply_acknowledgements(
        &self,
        listener_id: &str,
        strands: &[StrandUpdate],
        revisions: &[ListenerRevision],
    ) -> Result<bool, ListenerError> {
        let now = now_utc_ms();
        let mut continuation_needed = false;
        let mut failure = None;

        for revision in revisions {
            let sync_unit_id = revision.sync_unit_id();
            let Some(strand) = strands.iter().find(|strand| {
                strand.document_id == revision.document_id
                    && strand.scope == revision.scope
                    && strand.branch == revision.branch
            }) else {
                warn!(listener = %listener_id, sync_unit = %sync_unit_id, "Acknowledgement for untracked sync unit");
                continue;
            };

            match revision.status {
                UpdateStatus::Success | UpdateStatus::Missing => {
                    self.listeners.update_listener_revision(
                        listener_id,
                        &sync_unit_id,
                        revision.revision,
                        now,
                    )?;
                    if revision.status == UpdateStatus::Missing
                        || strand.last_index() != Some(revision.revision)
                    {
                        continuation_needed = true;
                    }
                }
                UpdateStatus::Conflict | UpdateStatus::Error => {
                    let message = revision.error.clone().unwrap_or_default();
                    if message.contains(MISSING_OPERATIONS) {
                        continuation_needed = true;
                    } else if failure.is_none() {
                        if let Some(status) = revision.status.error_status() {
                            failure = Some(ListenerError::operation(status, message));
                        }
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(continuation_needed),
        }
    }

    fn fail(
        &self,
        drive_id: &str,
        listener_id: &str,
        state: &ListenerState,
        e: ListenerError,
        on_error: &[ErrorCallback],
    ) {
        warn!(drive = %drive_id, listener = %listener_id, error = %e, "Listener update failed");
        let status = e.error_status();
        if let Err(status_error) = self
            .listeners
            .set_listener_status(listener_id, status.into(), Some(e.to_string()))
        {
            debug!(listener = %listener_id, error = %status_error, "Failed to record listener error");
        }
        self.status.update_status(
            drive_id,
            SyncDirection::Push,
            status.into(),
            Some(e.to_string()),
        );
        let state = self
            .listeners
            .get_listener_state(listener_id)
            .unwrap_or_else(|| state.clone());
        for callback in on_error {
            callback(&e, drive_id, &state);
        }
    }
}

/// Keeps listeners converged with the sync-unit revisions
pub struct ListenerManager {
    inner: Arc<UpdateLoop>,
    debouncer: Debouncer<UpdateResult>,
}

impl ListenerManager {
    pub fn new(
        options: ListenerManagerOptions,
        transmitters: Arc<TransmitterManager>,
        strands: Arc<StrandCollector>,
    ) -> Self {
        let inner = Arc::new(UpdateLoop {
            listeners: strands.listeners().clone(),
            sync_units: strands.sync_units().clone(),
            options: options.clone(),
            transmitters,
            strands,
            status: Arc::new(SyncStatusTracker::new()),
            pending: Mutex::new(PendingTrigger::default()),
            running: tokio::sync::Mutex::new(()),
        });
        let runner = inner.clone();
        let debouncer = Debouncer::new(options.update_delay, move || {
            let runner = runner.clone();
            async move { runner.run().await }
        });
        Self { inner, debouncer }
    }

    pub fn options(&self) -> &ListenerManagerOptions {
        &self.inner.options
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.inner.listeners
    }

    pub fn sync_units(&self) -> &Arc<SyncUnitRegistry> {
        &self.inner.sync_units
    }

    pub fn transmitters(&self) -> &Arc<TransmitterManager> {
        &self.inner.transmitters
    }

    pub fn sync_status(&self) -> &Arc<SyncStatusTracker> {
        &self.inner.status
    }

    /// Restore listeners from storage and create their transmitters.
    ///
    /// Listeners whose transmitter cannot be created stay registered; their
    /// failures come back together as `ListenerError::InitTransmitters`.
    pub async fn initialize(&self, storage: &dyn ListenerStorage) -> Result<(), ListenerError> {
        let states = storage.list_listeners().await?;
        let mut listeners = Vec::with_capacity(states.len());
        for state in states {
            let listener = state.listener.clone();
            match self.inner.listeners.restore(state) {
                Ok(()) | Err(StrandError::DuplicatedId(_)) => listeners.push(listener),
                Err(e) => return Err(e.into()),
            }
        }
        info!(count = listeners.len(), "Restored listeners");
        self.inner.transmitters.init_transmitters(&listeners).await?;
        Ok(())
    }

    /// Register a new listener; fails with `DuplicatedId` if it exists
    pub async fn add_listener(&self, listener: Listener) -> Result<(), ListenerError> {
        let listener_id = listener.listener_id.clone();
        self.inner.listeners.add_listener(listener.clone())?;
        if let Err(e) = self.inner.transmitters.create_transmitter(&listener).await {
            self.inner.listeners.remove_listener(&listener_id);
            return Err(e);
        }
        info!(drive = %listener.drive_id, listener = %listener_id, "Added listener");
        Ok(())
    }

    /// Add or replace a listener, keeping its acknowledgement state, and
    /// run an update right away
    pub async fn set_listener(&self, drive_id: &str, mut listener: Listener) -> Result<(), ListenerError> {
        listener.drive_id = drive_id.to_string();
        let listener_id = listener.listener_id.clone();
        let previous = self.inner.listeners.get_listener(&listener_id);
        self.inner.listeners.set_listener(listener.clone());

        let transport_changed = previous.map_or(false, |p| {
            p.transmitter_type != listener.transmitter_type || p.call_info != listener.call_info
        });
        if transport_changed {
            self.inner.transmitters.delete_transmitter(&listener_id).await;
        }
        match self.inner.transmitters.create_transmitter(&listener).await {
            Ok(_) | Err(ListenerError::DuplicatedTransmitter(_)) => {}
            Err(e) => return Err(e),
        }

        if let Err(e) = self.trigger_update(UpdateSource::Local, None, true).await {
            warn!(listener = %listener_id, error = %e, "Update after set_listener failed");
        }
        Ok(())
    }

    pub async fn remove_listener(&self, drive_id: &str, listener_id: &str) -> bool {
        let belongs = self
            .inner
            .listeners
            .get_listener(listener_id)
            .map_or(false, |l| l.drive_id == drive_id);
        if !belongs {
            return false;
        }
        self.inner.listeners.remove_listener(listener_id);
        self.inner.transmitters.delete_transmitter(listener_id).await;
        info!(drive = %drive_id, listener = %listener_id, "Removed listener");
        true
    }

    /// Forget every listener and sync unit of a drive
    pub async fn remove_drive(&self, drive_id: &str) {
        let removed = self.inner.listeners.remove_drive(drive_id);
        for state in &removed {
            self.inner
                .transmitters
                .delete_transmitter(&state.listener.listener_id)
                .await;
        }
        self.inner.sync_units.remove_drive(drive_id);
        self.inner.status.clear(drive_id);
        info!(drive = %drive_id, listeners = removed.len(), "Removed drive");
    }

    /// Drop deleted sync units and the drive's listener state for them
    pub fn remove_sync_units(&self, drive_id: &str, sync_units: &[SyncUnit]) {
        let ids: Vec<String> = sync_units.iter().map(|unit| unit.id.clone()).collect();
        for state in self.inner.listeners.listeners_for_drive(drive_id) {
            let _ = self
                .inner
                .listeners
                .remove_sync_units(&state.listener.listener_id, &ids);
        }
        for id in &ids {
            self.inner.sync_units.remove_sync_unit(id);
        }
    }

    pub fn get_listener_sync_units(
        &self,
        drive_id: &str,
        listener_id: &str,
    ) -> Result<Vec<SyncUnit>, ListenerError> {
        self.inner.strands.listener_sync_units(drive_id, listener_id)
    }

    pub fn update_listener_revision(
        &self,
        listener_id: &str,
        drive_id: &str,
        sync_id: &str,
        revision: u64,
    ) -> Result<(), ListenerError> {
        let belongs = self
            .inner
            .listeners
            .get_listener(listener_id)
            .map_or(false, |l| l.drive_id == drive_id);
        if !belongs {
            return Err(StrandError::listener_not_found(listener_id).into());
        }
        self.inner
            .listeners
            .update_listener_revision(listener_id, sync_id, revision, now_utc_ms())?;
        Ok(())
    }

    pub async fn get_transmitter(&self, listener_id: &str) -> Option<Transmitter> {
        self.inner.transmitters.get_transmitter(listener_id).await
    }

    /// Pull side: strands a listener has not acknowledged, without side effects
    pub async fn get_strands(
        &self,
        drive_id: &str,
        listener_id: &str,
        options: &GetStrandsOptions,
    ) -> Result<Vec<StrandUpdate>, ListenerError> {
        self.inner
            .strands
            .get_strands(drive_id, listener_id, options)
            .await
    }

    /// Schedule an update pass; `force` skips the debounce window.
    ///
    /// Resolves with the result of the pass that absorbed this call.
    pub async fn trigger_update(
        &self,
        source: UpdateSource,
        on_error: Option<ErrorCallback>,
        force: bool,
    ) -> UpdateResult {
        {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pending.source = source;
            pending.on_error.extend(on_error);
        }
        self.debouncer
            .call(force)
            .await
            .unwrap_or(Err(ListenerError::Cancelled))
    }

    /// Record new sync-unit revisions and update the listeners they outdate
    pub async fn update_synchronization_revisions(
        &self,
        drive_id: &str,
        sync_units: &[SyncUnit],
        source: UpdateSource,
        will_update: Option<WillUpdateCallback>,
        on_error: Option<ErrorCallback>,
        force_sync: bool,
    ) -> UpdateResult {
        let units: Vec<SyncUnit> = sync_units
            .iter()
            .map(|unit| self.inner.sync_units.upsert_revision(unit.clone()))
            .collect();

        let outdated: Vec<Listener> = self
            .inner
            .listeners
            .listeners_for_drive(drive_id)
            .into_iter()
            .filter(|state| units.iter().any(|unit| state.is_outdated(unit)))
            .map(|state| state.listener)
            .collect();
        if outdated.is_empty() {
            return Ok(Vec::new());
        }

        debug!(drive = %drive_id, listeners = outdated.len(), "Listeners outdated");
        if let Some(will_update) = will_update {
            will_update(&outdated);
        }
        self.trigger_update(source, on_error, force_sync).await
    }

    /// Cancel pending updates and disconnect all transmitters
    pub async fn shutdown(&self) {
        self.debouncer.cancel();
        self.inner.transmitters.disconnect_all().await;
    }
}
