//! Session lifecycle and outbox replay: hydration from the durable store,
//! the connectivity listener, batch flushing, and merging authoritative sync
//! responses back into local state.

use tracing::{debug, info, warn};

use daylist_core::model::{MutationOp, OutboxEntry, SyncResponse, Task};
use daylist_core::selection::Selection;

use crate::api::ApiError;
use crate::notice::{ConflictNotice, Notice};

use super::loader::LoadOptions;
use super::TaskStore;

impl TaskStore {
    /// One-time session setup: hydrates metadata from the durable snapshot
    /// and starts the connectivity listener. Safe to call more than once;
    /// only the first call in a session does anything. No-op outside
    /// interactive sessions.
    pub async fn initialize(&self) {
        if !self.inner.options.interactive {
            return;
        }
        if self
            .inner
            .initialized
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }

        match self.inner.store.load_snapshot() {
            Ok(snapshot) => {
                self.absorb_meta(snapshot.groups, snapshot.projects, false);
                if let Some(last_sync) = snapshot.last_sync {
                    debug!("hydrated session, last sync {last_sync}");
                }
            }
            Err(err) => warn!("snapshot hydration failed: {err:#}"),
        }

        self.spawn_connectivity_listener();

        if self.inner.connectivity.is_online() {
            let this = self.clone();
            tokio::spawn(async move {
                this.flush_outbox().await;
            });
        }
    }

    /// Queued mutations awaiting replay.
    pub fn pending_mutations(&self) -> usize {
        self.inner.store.outbox_len().unwrap_or(0)
    }

    fn spawn_connectivity_listener(&self) {
        let mut rx = self.inner.connectivity.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow();
                if !online {
                    continue;
                }
                info!("connectivity restored, replaying outbox");
                this.flush_outbox().await;
                // Server state may have moved while we were away.
                let selection = this.inner.state_tx.borrow().selection.clone();
                this.load(
                    selection,
                    LoadOptions {
                        force: true,
                        silent: true,
                        notify: false,
                    },
                )
                .await;
                this.refresh_counts().await;
            }
        });
    }

    /// Replays the outbox oldest-first in batches. Single-flight: a call
    /// that finds a flush already running returns immediately, because the
    /// running one will drain everything anyway.
    pub async fn flush_outbox(&self) {
        let Ok(_guard) = self.inner.flush_lock.try_lock() else {
            return;
        };

        loop {
            if !self.inner.connectivity.is_online() {
                return;
            }
            let batch = match self
                .inner
                .store
                .read_outbox_batch(self.inner.options.outbox_batch)
            {
                Ok(batch) => batch,
                Err(err) => {
                    warn!("outbox read failed: {err:#}");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }

            let ops: Vec<MutationOp> = batch.iter().map(|e| e.op.clone()).collect();
            debug!("replaying {} queued mutation(s)", ops.len());

            match self.inner.remote.sync(&ops).await {
                Ok(response) => {
                    let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();
                    if let Err(err) = self.inner.store.remove_outbox_entries(&ids) {
                        // Entries will be replayed next flush; the mutation
                        // endpoint tolerates duplicates per (op, id).
                        warn!("outbox cleanup failed, entries will replay: {err:#}");
                    }
                    self.apply_sync_response(response);
                }
                Err(ApiError::Transport(reason)) => {
                    // Retryable: everything stays queued, optimistic state
                    // stands.
                    debug!("outbox replay deferred: {reason}");
                    return;
                }
                Err(ApiError::Rejected(reason)) => {
                    warn!("outbox batch rejected: {reason}");
                    self.rollback_batch(&batch, &reason);
                }
            }
        }
    }

    /// Undoes the optimistic effects of a permanently rejected batch using
    /// the `prior` snapshots, newest entry first, and drops the entries so
    /// they never replay.
    fn rollback_batch(&self, batch: &[OutboxEntry], reason: &str) {
        for entry in batch.iter().rev() {
            let current = self.find_task(entry.op.target_id());
            match (&entry.prior, &current) {
                // Mutation of an existing record: restore the snapshot.
                (Some(prior), current) => self.apply_record(Some(prior), current.as_ref()),
                // Rejected create: the optimistic record simply goes away.
                (None, Some(current)) => self.apply_record(None, Some(current)),
                (None, None) => {}
            }
        }
        let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();
        if let Err(err) = self.inner.store.remove_outbox_entries(&ids) {
            warn!("failed to drop rejected outbox entries: {err:#}");
        }
        let message = format!("Changes were rejected by the server: {reason}");
        self.update_state(move |s| s.error = Some(message));
    }

    /// Merges the authoritative result of a replay: record patches, metadata
    /// patches, conflicts, and server-generated successor tasks.
    pub(crate) fn apply_sync_response(&self, response: SyncResponse) {
        if let Some(updates) = response.updates {
            for patch in &updates.tasks {
                // Patches for records we do not hold are picked up by the
                // next fetch.
                let Some(before) = self.find_task(&patch.id) else {
                    continue;
                };
                let mut after = before.clone();
                patch.apply_to(&mut after);
                if after.is_hidden() {
                    self.apply_record(None, Some(&before));
                } else {
                    self.apply_record(Some(&after), Some(&before));
                }
            }

            if !updates.groups.is_empty() || !updates.projects.is_empty() {
                let (groups, projects) = {
                    let meta = self.inner.meta.lock();
                    let groups = updates
                        .groups
                        .iter()
                        .filter_map(|patch| match meta.groups.get(&patch.id) {
                            Some(existing) => {
                                let mut group = existing.clone();
                                patch.apply_to(&mut group);
                                Some(group)
                            }
                            None => patch.clone().into_group(),
                        })
                        .collect::<Vec<_>>();
                    let projects = updates
                        .projects
                        .iter()
                        .filter_map(|patch| match meta.projects.get(&patch.id) {
                            Some(existing) => {
                                let mut project = existing.clone();
                                patch.apply_to(&mut project);
                                Some(project)
                            }
                            None => patch.clone().into_project(),
                        })
                        .collect::<Vec<_>>();
                    (groups, projects)
                };
                self.absorb_meta(groups, projects, true);
            }
        }

        if !response.conflicts.is_empty() {
            let conflict = ConflictNotice::new(response.conflicts);
            self.update_state(move |s| s.conflict = Some(conflict));
        }

        if !response.next_tasks.is_empty() {
            let next: Vec<Task> = response
                .next_tasks
                .into_iter()
                .filter(|t| !t.is_hidden())
                .collect();
            for task in &next {
                self.apply_record(Some(task), None);
            }
            if let Some(hook) = self.inner.next_tasks_hook.lock().as_ref() {
                hook(&next);
            }
            self.post_notice(Notice::Info(
                "Next occurrence of a recurring task was scheduled".to_string(),
            ));
        }
    }

    /// Silent post-mutation reconcile: after the configured delay, refetch
    /// the current view and the authoritative counts.
    pub(crate) fn schedule_reconcile(&self) {
        let this = self.clone();
        let delay = self.inner.options.reconcile_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let selection = this.inner.state_tx.borrow().selection.clone();
            this.load(
                selection.clone(),
                LoadOptions {
                    force: true,
                    silent: true,
                    notify: false,
                },
            )
            .await;
            if selection != Selection::Today {
                this.load(
                    Selection::Today,
                    LoadOptions {
                        force: true,
                        silent: true,
                        notify: false,
                    },
                )
                .await;
            }
            this.refresh_counts().await;
        });
    }
}
